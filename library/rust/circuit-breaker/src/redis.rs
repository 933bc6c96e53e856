use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};

use crate::state::error_percentage;
use crate::store::StateStore;
use crate::{CircuitState, StateStoreError};

const FIELD_OPEN: &str = "open";
const FIELD_OPENED_AT: &str = "opened_at";
const FIELD_TOTAL: &str = "total";
const FIELD_SUCCESS: &str = "success";
const FIELD_FAILURE: &str = "failure";

/// Redis のハッシュにサーキット状態を保持するストア。
///
/// サービスごとに `{prefix}:{service}` のハッシュを使い、複数プロセス間で状態を共有する。
/// 状態遷移は Lua スクリプト、カウンタ更新は MULTI/EXEC で原子的に行う。
#[derive(Clone)]
pub struct RedisStateStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisStateStore {
    /// Redis URL から接続する (例: "redis://127.0.0.1:6379")。
    pub async fn new(url: &str) -> Result<Self, StateStoreError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "circuit".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn state_key(&self, service: &str) -> String {
        format_state_key(&self.key_prefix, service)
    }

    async fn hget(&self, service: &str, field: &str) -> Result<Option<String>, StateStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGET")
            .arg(self.state_key(service))
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn incr_pair(&self, service: &str, field: &str) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        let key = self.state_key(service);
        let _: () = redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&key)
            .arg(FIELD_TOTAL)
            .arg(1)
            .ignore()
            .cmd("HINCRBY")
            .arg(&key)
            .arg(field)
            .arg(1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

/// 閉じている場合のみオープンにし、打刻する。
const TRY_OPEN_SCRIPT: &str = r#"
if redis.call("hget", KEYS[1], "open") == "1" then
    return 0
end
redis.call("hset", KEYS[1], "open", "1", "opened_at", ARGV[1])
return 1
"#;

/// opened_at が観測値のままの場合のみ打刻し直す。
const CLAIM_TRIAL_SCRIPT: &str = r#"
if redis.call("hget", KEYS[1], "opened_at") == ARGV[1] then
    redis.call("hset", KEYS[1], "opened_at", ARGV[2])
    return 1
else
    return 0
end
"#;

const CLOSE_AND_RESET_SCRIPT: &str = r#"
redis.call("hdel", KEYS[1], "opened_at")
redis.call("hset", KEYS[1], "open", "0", "total", "0", "success", "0", "failure", "0")
return 1
"#;

#[async_trait]
impl StateStore for RedisStateStore {
    async fn register_service(&self, service: &str) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        let key = self.state_key(service);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for field in [FIELD_OPEN, FIELD_TOTAL, FIELD_SUCCESS, FIELD_FAILURE] {
            pipe.cmd("HSETNX").arg(&key).arg(field).arg("0").ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(())
    }

    async fn is_open(&self, service: &str) -> Result<bool, StateStoreError> {
        Ok(self.hget(service, FIELD_OPEN).await?.as_deref() == Some("1"))
    }

    async fn set_circuit_is_open(&self, service: &str, open: bool) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.state_key(service))
            .arg(FIELD_OPEN)
            .arg(if open { "1" } else { "0" })
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn get_open_timestamp(
        &self,
        service: &str,
    ) -> Result<Option<DateTime<Utc>>, StateStoreError> {
        self.hget(service, FIELD_OPENED_AT)
            .await?
            .map(|raw| parse_timestamp(service, &raw))
            .transpose()
    }

    async fn set_open_timestamp(
        &self,
        service: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        let key = self.state_key(service);
        let cmd = match timestamp {
            Some(ts) => {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(&key).arg(FIELD_OPENED_AT).arg(ts.timestamp_millis());
                cmd
            }
            None => {
                let mut cmd = redis::cmd("HDEL");
                cmd.arg(&key).arg(FIELD_OPENED_AT);
                cmd
            }
        };
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn get_total_requests(&self, service: &str) -> Result<u64, StateStoreError> {
        match self.hget(service, FIELD_TOTAL).await? {
            Some(raw) => parse_counter(service, FIELD_TOTAL, &raw),
            None => Ok(0),
        }
    }

    async fn get_error_percentage(&self, service: &str) -> Result<f64, StateStoreError> {
        let state = self.snapshot(service).await?;
        Ok(error_percentage(state.failure_count, state.total_requests))
    }

    async fn add_success(&self, service: &str) -> Result<(), StateStoreError> {
        self.incr_pair(service, FIELD_SUCCESS).await
    }

    async fn add_failure(&self, service: &str) -> Result<(), StateStoreError> {
        self.incr_pair(service, FIELD_FAILURE).await
    }

    async fn reset_request_stats(&self, service: &str) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.state_key(service))
            .arg(FIELD_TOTAL)
            .arg("0")
            .arg(FIELD_SUCCESS)
            .arg("0")
            .arg(FIELD_FAILURE)
            .arg("0")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn try_open(&self, service: &str, now: DateTime<Utc>) -> Result<bool, StateStoreError> {
        let mut conn = self.conn.clone();
        let script = Script::new(TRY_OPEN_SCRIPT);
        let result: i64 = script
            .key(self.state_key(service))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(result == 1)
    }

    async fn try_claim_trial(
        &self,
        service: &str,
        observed: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StateStoreError> {
        let mut conn = self.conn.clone();
        let script = Script::new(CLAIM_TRIAL_SCRIPT);
        let result: i64 = script
            .key(self.state_key(service))
            .arg(observed.timestamp_millis())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(result == 1)
    }

    async fn close_and_reset(&self, service: &str) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        let script = Script::new(CLOSE_AND_RESET_SCRIPT);
        let _: i64 = script
            .key(self.state_key(service))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn snapshot(&self, service: &str) -> Result<CircuitState, StateStoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.state_key(service))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        parse_state(service, &fields)
    }
}

fn map_redis_error(err: RedisError) -> StateStoreError {
    StateStoreError::Connection(err.to_string())
}

/// ハッシュキーを組み立てる（Redis 接続なしでテストできるよう公開）。
pub fn format_state_key(prefix: &str, service: &str) -> String {
    format!("{prefix}:{service}")
}

fn parse_counter(service: &str, field: &str, raw: &str) -> Result<u64, StateStoreError> {
    raw.parse().map_err(|_| StateStoreError::Corrupted {
        service: service.to_string(),
        detail: format!("{field}={raw}"),
    })
}

fn parse_timestamp(service: &str, raw: &str) -> Result<DateTime<Utc>, StateStoreError> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| StateStoreError::Corrupted {
            service: service.to_string(),
            detail: format!("{FIELD_OPENED_AT}={raw}"),
        })
}

fn parse_state(
    service: &str,
    fields: &HashMap<String, String>,
) -> Result<CircuitState, StateStoreError> {
    let counter = |field: &str| match fields.get(field) {
        Some(raw) => parse_counter(service, field, raw),
        None => Ok(0),
    };
    Ok(CircuitState {
        is_open: fields.get(FIELD_OPEN).map(String::as_str) == Some("1"),
        opened_at: fields
            .get(FIELD_OPENED_AT)
            .map(|raw| parse_timestamp(service, raw))
            .transpose()?,
        total_requests: counter(FIELD_TOTAL)?,
        success_count: counter(FIELD_SUCCESS)?,
        failure_count: counter(FIELD_FAILURE)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_format_state_key() {
        assert_eq!(format_state_key("circuit", "orders"), "circuit:orders");
        assert_eq!(
            format_state_key("myapp:circuit", "orders"),
            "myapp:circuit:orders"
        );
    }

    #[test]
    fn test_parse_state_missing_hash_is_closed() {
        let state = parse_state("orders", &HashMap::new()).unwrap();
        assert_eq!(state, CircuitState::default());
    }

    #[test]
    fn test_parse_state() {
        let state = parse_state(
            "orders",
            &fields(&[
                ("open", "1"),
                ("opened_at", "1700000000000"),
                ("total", "4"),
                ("success", "1"),
                ("failure", "3"),
            ]),
        )
        .unwrap();
        assert!(state.is_open);
        assert_eq!(
            state.opened_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert_eq!(state.total_requests, 4);
        assert!((state.error_percentage() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_state_rejects_garbage() {
        let result = parse_state("orders", &fields(&[("total", "many")]));
        match result {
            Err(StateStoreError::Corrupted { service, detail }) => {
                assert_eq!(service, "orders");
                assert!(detail.contains("total"));
            }
            other => panic!("Expected Corrupted error, got {other:?}"),
        }
    }

    #[test]
    fn test_map_redis_error_to_store_error() {
        let err = map_redis_error(RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        match err {
            StateStoreError::Connection(msg) => assert!(msg.contains("connection refused")),
            _ => panic!("Expected Connection error"),
        }
    }

    #[test]
    fn test_scripts_guard_their_transitions() {
        assert!(TRY_OPEN_SCRIPT.contains("redis.call(\"hget\", KEYS[1], \"open\")"));
        assert!(CLAIM_TRIAL_SCRIPT.contains("redis.call(\"hget\", KEYS[1], \"opened_at\")"));
        assert!(CLOSE_AND_RESET_SCRIPT.contains("redis.call(\"hdel\""));
        assert!(CLOSE_AND_RESET_SCRIPT.contains("\"total\", \"0\""));
    }
}
