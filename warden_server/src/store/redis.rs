//! Redis-backed state store

use super::{Counter, StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use fred::prelude::*;
use fred::types::config::Config as RedisConfig;
use std::future::Future;
use std::time::Duration;

/// Initialize Redis client
pub async fn init_client(redis_url: &str) -> anyhow::Result<Client> {
    let config = RedisConfig::from_url(redis_url)?;
    let client = Client::new(config, None, None, None);
    client.init().await?;
    Ok(client)
}

/// State store over a shared Redis deployment.
///
/// Multi-step operations run inside MULTI/EXEC so a cancelled request either
/// lands the whole update or none of it.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Run a Redis call under the store timeout
    async fn timed<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, fred::error::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(format!("{}: {}", op, e))),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

fn as_u64(value: &Value) -> u64 {
    value.as_i64().map(|v| v.max(0) as u64).unwrap_or(0)
}

/// Parse a WITHSCORES reply. RESP2 returns a flat list, RESP3 nested pairs.
fn parse_scored(values: Vec<Value>) -> Vec<(String, f64)> {
    let mut scored = Vec::with_capacity(values.len() / 2);
    let mut iter = values.into_iter();

    while let Some(value) = iter.next() {
        match value {
            Value::Array(pair) if pair.len() == 2 => {
                if let (Some(member), Some(score)) = (pair[0].as_string(), pair[1].as_f64()) {
                    scored.push((member, score));
                }
            }
            member => {
                let score = iter.next().and_then(|s| s.as_f64());
                if let (Some(member), Some(score)) = (member.as_string(), score) {
                    scored.push((member, score));
                }
            }
        }
    }

    scored
}

#[async_trait]
impl StateStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        self.timed("PING", self.client.ping::<()>(None)).await
    }

    async fn incr_with_expiry(&self, keys: &[(String, Duration)]) -> StoreResult<Vec<Counter>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Value> = self
            .timed("INCR_WITH_EXPIRY", async {
                let trx = self.client.multi();
                for (key, ttl) in keys {
                    // SET NX EX creates the counter with its expiry; INCR keeps the TTL
                    trx.set::<(), _, _>(
                        key.as_str(),
                        0,
                        Some(Expiration::EX(ttl_secs(*ttl))),
                        Some(SetOptions::NX),
                        false,
                    )
                    .await?;
                    trx.incr::<(), _>(key.as_str()).await?;
                    trx.ttl::<(), _>(key.as_str()).await?;
                }
                trx.exec(true).await
            })
            .await?;

        if values.len() != keys.len() * 3 {
            return Err(StoreError::Corrupt {
                key: keys[0].0.clone(),
                reason: format!("expected {} replies, got {}", keys.len() * 3, values.len()),
            });
        }

        Ok(values
            .chunks(3)
            .zip(keys)
            .map(|(reply, (_, ttl))| Counter {
                count: as_u64(&reply[1]),
                ttl_secs: match reply[2].as_i64() {
                    Some(t) if t > 0 => t as u64,
                    _ => ttl.as_secs(),
                },
            })
            .collect())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.timed("GET", self.client.get::<Option<String>, _>(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.timed(
            "SETEX",
            self.client
                .set::<(), _, _>(key, value, Some(Expiration::EX(ttl_secs(ttl))), None, false),
        )
        .await
    }

    async fn replace_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        // XX makes SET a no-op on a missing key; the reply is then nil
        let reply: Value = self
            .timed(
                "SET XX",
                self.client.set(
                    key,
                    value,
                    Some(Expiration::EX(ttl_secs(ttl))),
                    Some(SetOptions::XX),
                    false,
                ),
            )
            .await?;
        Ok(!reply.is_null())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.timed("DEL", self.client.del::<i64, _>(key)).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> StoreResult<()> {
        self.timed("ZADD", async {
            let trx = self.client.multi();
            trx.zadd::<(), _, _>(key, None, None, false, false, (score, member))
                .await?;
            trx.expire::<(), _>(key, ttl_secs(ttl), None).await?;
            trx.exec::<()>(true).await
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.timed("ZREM", self.client.zrem::<i64, _, _>(key, member))
            .await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let values: Vec<Value> = self
            .timed(
                "ZRANGEBYSCORE",
                self.client.zrangebyscore(key, min, max, true, None),
            )
            .await?;
        Ok(parse_scored(values))
    }

    async fn window_push(
        &self,
        key: &str,
        score: f64,
        member: &str,
        window: Duration,
        max_len: usize,
    ) -> StoreResult<u64> {
        let cutoff = score - window.as_millis() as f64;
        let keep = max_len.max(1) as i64;

        let values: Vec<Value> = self
            .timed("WINDOW_PUSH", async {
                let trx = self.client.multi();
                trx.zremrangebyscore::<(), _, _, _>(key, "-inf", cutoff).await?;
                trx.zadd::<(), _, _>(key, None, None, false, false, (score, member))
                    .await?;
                trx.zremrangebyrank::<(), _>(key, 0, -(keep + 1)).await?;
                trx.expire::<(), _>(key, ttl_secs(window), None).await?;
                trx.zcard::<(), _>(key).await?;
                trx.exec(true).await
            })
            .await?;

        values
            .last()
            .and_then(|v| v.as_i64())
            .map(|count| count.max(0) as u64)
            .ok_or_else(|| StoreError::Corrupt {
                key: key.to_string(),
                reason: "missing ZCARD reply".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_withscores() {
        let values = vec![
            Value::from("a"),
            Value::from("1000"),
            Value::from("b"),
            Value::from("2000"),
        ];
        assert_eq!(
            parse_scored(values),
            vec![("a".to_string(), 1000.0), ("b".to_string(), 2000.0)]
        );
    }

    #[test]
    fn test_parse_nested_withscores() {
        let values = vec![Value::Array(vec![Value::from("a"), Value::Double(5.0)])];
        assert_eq!(parse_scored(values), vec![("a".to_string(), 5.0)]);
    }

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
    }
}
