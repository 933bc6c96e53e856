use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::store::StateStore;
use crate::{CircuitState, StateStoreError};

/// プロセス内で状態を共有するストア。各操作は単一の書き込みロック内で完結する。
#[derive(Clone)]
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, CircuitState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn read<R>(&self, service: &str, f: impl FnOnce(&CircuitState) -> R) -> R {
        let states = self.states.read().await;
        match states.get(service) {
            Some(state) => f(state),
            None => f(&CircuitState::default()),
        }
    }

    async fn update<R>(&self, service: &str, f: impl FnOnce(&mut CircuitState) -> R) -> R {
        let mut states = self.states.write().await;
        f(states.entry(service.to_string()).or_default())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn register_service(&self, service: &str) -> Result<(), StateStoreError> {
        self.update(service, |_| ()).await;
        Ok(())
    }

    async fn is_open(&self, service: &str) -> Result<bool, StateStoreError> {
        Ok(self.read(service, |s| s.is_open).await)
    }

    async fn set_circuit_is_open(&self, service: &str, open: bool) -> Result<(), StateStoreError> {
        self.update(service, |s| s.is_open = open).await;
        Ok(())
    }

    async fn get_open_timestamp(
        &self,
        service: &str,
    ) -> Result<Option<DateTime<Utc>>, StateStoreError> {
        Ok(self.read(service, |s| s.opened_at).await)
    }

    async fn set_open_timestamp(
        &self,
        service: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StateStoreError> {
        self.update(service, |s| s.opened_at = timestamp).await;
        Ok(())
    }

    async fn get_total_requests(&self, service: &str) -> Result<u64, StateStoreError> {
        Ok(self.read(service, |s| s.total_requests).await)
    }

    async fn get_error_percentage(&self, service: &str) -> Result<f64, StateStoreError> {
        Ok(self.read(service, CircuitState::error_percentage).await)
    }

    async fn add_success(&self, service: &str) -> Result<(), StateStoreError> {
        self.update(service, CircuitState::record_success).await;
        Ok(())
    }

    async fn add_failure(&self, service: &str) -> Result<(), StateStoreError> {
        self.update(service, CircuitState::record_failure).await;
        Ok(())
    }

    async fn reset_request_stats(&self, service: &str) -> Result<(), StateStoreError> {
        self.update(service, CircuitState::reset_stats).await;
        Ok(())
    }

    async fn try_open(&self, service: &str, now: DateTime<Utc>) -> Result<bool, StateStoreError> {
        let opened = self
            .update(service, |s| {
                if s.is_open {
                    return false;
                }
                s.is_open = true;
                s.opened_at = Some(now);
                true
            })
            .await;
        Ok(opened)
    }

    async fn try_claim_trial(
        &self,
        service: &str,
        observed: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StateStoreError> {
        let claimed = self
            .update(service, |s| {
                if s.opened_at != Some(observed) {
                    return false;
                }
                s.opened_at = Some(now);
                true
            })
            .await;
        Ok(claimed)
    }

    async fn close_and_reset(&self, service: &str) -> Result<(), StateStoreError> {
        self.update(service, |s| *s = CircuitState::default()).await;
        Ok(())
    }

    async fn snapshot(&self, service: &str) -> Result<CircuitState, StateStoreError> {
        Ok(self.read(service, Clone::clone).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_unknown_service_reads_as_closed_and_empty() {
        let store = InMemoryStateStore::new();
        assert!(!store.is_open("unknown").await.unwrap());
        assert_eq!(store.get_open_timestamp("unknown").await.unwrap(), None);
        assert_eq!(store.get_total_requests("unknown").await.unwrap(), 0);
        assert!(store.get_error_percentage("unknown").await.unwrap().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_counters() {
        let store = InMemoryStateStore::new();
        store.register_service("svc").await.unwrap();
        store.add_failure("svc").await.unwrap();
        store.add_success("svc").await.unwrap();

        let snapshot = store.snapshot("svc").await.unwrap();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.failure_count, 1);
        assert!((store.get_error_percentage("svc").await.unwrap() - 50.0).abs() < f64::EPSILON);

        store.reset_request_stats("svc").await.unwrap();
        assert_eq!(store.get_total_requests("svc").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_services_are_isolated() {
        let store = InMemoryStateStore::new();
        store.add_failure("a").await.unwrap();
        store.set_circuit_is_open("a", true).await.unwrap();

        assert!(store.is_open("a").await.unwrap());
        assert!(!store.is_open("b").await.unwrap());
        assert_eq!(store.get_total_requests("b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_try_open_only_transitions_once() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();
        assert!(store.try_open("svc", now).await.unwrap());
        assert!(!store
            .try_open("svc", now + Duration::milliseconds(5))
            .await
            .unwrap());
        assert_eq!(store.get_open_timestamp("svc").await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn test_try_claim_trial_is_compare_and_swap() {
        let store = InMemoryStateStore::new();
        let opened = Utc::now();
        store.set_open_timestamp("svc", Some(opened)).await.unwrap();

        let later = opened + Duration::seconds(1);
        assert!(store.try_claim_trial("svc", opened, later).await.unwrap());
        // 既に別の呼び出し元が打刻し直しているため失敗する
        assert!(!store
            .try_claim_trial("svc", opened, later + Duration::seconds(1))
            .await
            .unwrap());
        assert_eq!(store.get_open_timestamp("svc").await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn test_close_and_reset_clears_everything() {
        let store = InMemoryStateStore::new();
        store.add_failure("svc").await.unwrap();
        store.add_failure("svc").await.unwrap();
        store.try_open("svc", Utc::now()).await.unwrap();

        store.close_and_reset("svc").await.unwrap();
        assert_eq!(store.snapshot("svc").await.unwrap(), CircuitState::default());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryStateStore::new();
        let other = store.clone();
        store.add_success("svc").await.unwrap();
        assert_eq!(other.get_total_requests("svc").await.unwrap(), 1);
    }
}
