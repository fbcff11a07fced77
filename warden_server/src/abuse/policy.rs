//! Endpoint classification and the store-outage policy table
//!
//! This table is security-relevant configuration: it decides which endpoints
//! stay reachable when the state store is down. Review changes here the way
//! you would review a firewall rule.

use once_cell::sync::Lazy;

/// Endpoint categories with their own capacity tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointCategory {
    Login,
    Registration,
    PasswordReset,
    Otp,
    Admin,
    Search,
    Upload,
    Bulk,
    Default,
}

impl EndpointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Login => "login",
            EndpointCategory::Registration => "registration",
            EndpointCategory::PasswordReset => "password_reset",
            EndpointCategory::Otp => "otp",
            EndpointCategory::Admin => "admin",
            EndpointCategory::Search => "search",
            EndpointCategory::Upload => "upload",
            EndpointCategory::Bulk => "bulk",
            EndpointCategory::Default => "default",
        }
    }

    /// Endpoints where a lockout must be checked before credentials are
    pub fn is_auth_sensitive(&self) -> bool {
        matches!(
            self,
            EndpointCategory::Login | EndpointCategory::PasswordReset | EndpointCategory::Otp
        )
    }

    /// Behavior when the state store cannot be reached
    pub fn failure_mode(&self) -> FailureMode {
        match self {
            EndpointCategory::Login
            | EndpointCategory::Registration
            | EndpointCategory::PasswordReset
            | EndpointCategory::Otp
            | EndpointCategory::Admin => FailureMode::FailClosed,
            EndpointCategory::Search
            | EndpointCategory::Upload
            | EndpointCategory::Bulk
            | EndpointCategory::Default => FailureMode::FailOpen,
        }
    }

    /// Capacities for an authenticated user, per (minute, hour, day)
    fn base_limits(&self) -> Limits {
        match self {
            EndpointCategory::Login => Limits::new(10, 50, 200),
            EndpointCategory::Registration => Limits::new(5, 20, 50),
            EndpointCategory::PasswordReset => Limits::new(5, 15, 30),
            EndpointCategory::Otp => Limits::new(10, 30, 100),
            EndpointCategory::Admin => Limits::new(60, 1_000, 5_000),
            EndpointCategory::Search => Limits::new(60, 1_000, 10_000),
            EndpointCategory::Upload => Limits::new(10, 100, 500),
            EndpointCategory::Bulk => Limits::new(5, 50, 200),
            EndpointCategory::Default => Limits::new(120, 3_000, 30_000),
        }
    }

    /// Capacities for a subject class on this category
    pub fn limits(&self, class: SubjectClass) -> Limits {
        let base = self.base_limits();
        match class {
            SubjectClass::Anonymous => base.scaled_down(2),
            SubjectClass::Authenticated => base,
            SubjectClass::Trusted => base.scaled_up(10),
        }
    }
}

/// What to do when the store is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Admit with a drastically reduced synthetic quota
    FailOpen,
    /// Deny with a short retry-after
    FailClosed,
}

/// Who is calling, from most to least restricted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubjectClass {
    Anonymous,
    Authenticated,
    Trusted,
}

/// Capacity per horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Limits {
    pub const fn new(per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        Self {
            per_minute,
            per_hour,
            per_day,
        }
    }

    fn scaled_down(self, divisor: u32) -> Self {
        Self {
            per_minute: (self.per_minute / divisor).max(1),
            per_hour: (self.per_hour / divisor).max(1),
            per_day: (self.per_day / divisor).max(1),
        }
    }

    fn scaled_up(self, factor: u32) -> Self {
        Self {
            per_minute: self.per_minute.saturating_mul(factor),
            per_hour: self.per_hour.saturating_mul(factor),
            per_day: self.per_day.saturating_mul(factor),
        }
    }
}

/// Path segments that identify each category, checked in order
static ENDPOINT_RULES: Lazy<Vec<(EndpointCategory, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        (EndpointCategory::Login, &["login", "signin", "sign-in", "token"][..]),
        (EndpointCategory::Registration, &["register", "registration", "signup", "sign-up"][..]),
        (
            EndpointCategory::PasswordReset,
            &["password-reset", "reset-password", "forgot-password", "password"][..],
        ),
        (EndpointCategory::Otp, &["otp", "mfa", "2fa", "verify-otp"][..]),
        (EndpointCategory::Admin, &["admin"][..]),
        (EndpointCategory::Bulk, &["bulk", "batch", "import"][..]),
        (EndpointCategory::Upload, &["upload", "uploads"][..]),
        (EndpointCategory::Search, &["search"][..]),
    ]
});

/// Normalize a request path for keying: lowercase, no query, no trailing slash
pub fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Classify a request path
pub fn classify(path: &str) -> EndpointCategory {
    let path = normalize_path(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    ENDPOINT_RULES
        .iter()
        .find(|(_, names)| segments.iter().any(|seg| names.contains(seg)))
        .map(|(category, _)| *category)
        .unwrap_or(EndpointCategory::Default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_endpoints() {
        assert_eq!(classify("/auth/login"), EndpointCategory::Login);
        assert_eq!(classify("/api/v1/auth/register/"), EndpointCategory::Registration);
        assert_eq!(classify("/auth/forgot-password"), EndpointCategory::PasswordReset);
        assert_eq!(classify("/auth/otp?code=1"), EndpointCategory::Otp);
        assert_eq!(classify("/admin/users/42"), EndpointCategory::Admin);

        for path in ["/auth/login", "/auth/signup", "/auth/password", "/auth/mfa", "/admin"] {
            assert_eq!(
                classify(path).failure_mode(),
                FailureMode::FailClosed,
                "{} should fail closed",
                path
            );
        }
    }

    #[test]
    fn test_non_critical_endpoints() {
        assert_eq!(classify("/products/search"), EndpointCategory::Search);
        assert_eq!(classify("/files/upload"), EndpointCategory::Upload);
        assert_eq!(classify("/orders/bulk"), EndpointCategory::Bulk);
        assert_eq!(classify("/products/17"), EndpointCategory::Default);
        assert_eq!(classify("/"), EndpointCategory::Default);

        for path in ["/products/search", "/files/upload", "/orders/bulk", "/categories"] {
            assert_eq!(classify(path).failure_mode(), FailureMode::FailOpen);
        }
    }

    #[test]
    fn test_segment_match_not_substring() {
        // "catalog" contains "log" but is not a login endpoint
        assert_eq!(classify("/catalog/researchers"), EndpointCategory::Default);
    }

    #[test]
    fn test_subject_class_ordering() {
        for category in [EndpointCategory::Login, EndpointCategory::Search, EndpointCategory::Default] {
            let anon = category.limits(SubjectClass::Anonymous);
            let user = category.limits(SubjectClass::Authenticated);
            let trusted = category.limits(SubjectClass::Trusted);
            assert!(anon.per_minute < user.per_minute);
            assert!(user.per_minute < trusted.per_minute);
            assert!(anon.per_day < user.per_day);
        }
    }

    #[test]
    fn test_auth_sensitive() {
        assert!(EndpointCategory::Login.is_auth_sensitive());
        assert!(EndpointCategory::Otp.is_auth_sensitive());
        assert!(!EndpointCategory::Search.is_auth_sensitive());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/Auth/Login/?next=/"), "/auth/login");
        assert_eq!(normalize_path(""), "/");
    }
}
