//! Device fingerprints derived from request headers

use sha2::{Digest, Sha256};
use warden_common::InboundRequest;

/// Minimum estimated entropy for a usable fingerprint
pub const MIN_ENTROPY_BITS: u32 = 16;

/// Header, estimated bits of identifying entropy, required
const SOURCES: [(&str, u32, bool); 8] = [
    ("user-agent", 10, true),
    ("accept-language", 5, true),
    ("accept", 3, false),
    ("accept-encoding", 2, false),
    ("sec-ch-ua", 4, false),
    ("sec-ch-ua-platform", 2, false),
    ("sec-ch-ua-mobile", 1, false),
    ("dnt", 1, false),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    /// Hex SHA-256 over the normalized header values
    pub hash: String,
    pub entropy_bits: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    #[error("estimated entropy {bits} bits is below the {required}-bit minimum")]
    InsufficientEntropy { bits: u32, required: u32 },
}

/// Derive the device fingerprint for a request
pub fn derive(request: &InboundRequest) -> Result<DeviceFingerprint, FingerprintError> {
    let mut hasher = Sha256::new();
    let mut entropy_bits = 0;

    for (name, bits, required) in SOURCES {
        let value = request
            .header(name)
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match value {
            Some(value) => {
                entropy_bits += bits;
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
            None if required => return Err(FingerprintError::MissingHeader(name)),
            None => hasher.update(name.as_bytes()),
        }
        hasher.update(b"\n");
    }

    if entropy_bits < MIN_ENTROPY_BITS {
        return Err(FingerprintError::InsufficientEntropy {
            bits: entropy_bits,
            required: MIN_ENTROPY_BITS,
        });
    }

    Ok(DeviceFingerprint {
        hash: hex::encode(hasher.finalize()),
        entropy_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> InboundRequest {
        InboundRequest {
            ip_address: "192.0.2.1".to_string(),
            raw_headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    const BROWSER: &[(&str, &str)] = &[
        ("User-Agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0"),
        ("Accept-Language", "en-US,en;q=0.5"),
        ("Accept", "text/html,application/xhtml+xml"),
        ("Accept-Encoding", "gzip, deflate, br"),
    ];

    #[test]
    fn test_stable_and_case_insensitive() {
        let a = derive(&request(BROWSER)).unwrap();
        let lowered: Vec<(String, String)> = BROWSER
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();
        let b = derive(&InboundRequest {
            raw_headers: lowered,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.entropy_bits, 20);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn test_user_agent_field_counts() {
        let mut req = request(&BROWSER[1..]);
        req.user_agent = Some(BROWSER[0].1.to_string());
        assert_eq!(derive(&req).unwrap(), derive(&request(BROWSER)).unwrap());
    }

    #[test]
    fn test_required_headers() {
        assert_eq!(
            derive(&request(&BROWSER[1..])),
            Err(FingerprintError::MissingHeader("user-agent"))
        );
        assert_eq!(
            derive(&request(&[BROWSER[0], BROWSER[2], BROWSER[3]])),
            Err(FingerprintError::MissingHeader("accept-language"))
        );
    }

    #[test]
    fn test_minimum_entropy() {
        // User-Agent and Accept-Language alone give 15 bits
        assert_eq!(
            derive(&request(&BROWSER[..2])),
            Err(FingerprintError::InsufficientEntropy {
                bits: 15,
                required: MIN_ENTROPY_BITS
            })
        );
        assert!(derive(&request(&[BROWSER[0], BROWSER[1], ("DNT", "1")])).is_ok());
    }

    #[test]
    fn test_different_devices_differ() {
        let mut other = BROWSER.to_vec();
        other[0] = ("User-Agent", "curl/8.5.0");
        assert_ne!(derive(&request(BROWSER)).unwrap(), derive(&request(&other)).unwrap());
    }
}
