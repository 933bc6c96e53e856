use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{CircuitState, StateStoreError};

/// サーキット状態を保持する外部ストアの契約。
///
/// すべての操作はサービス名をキーとし、書き込みは以降の読み出しに即座に反映されなければならない。
/// 未登録のサービスの読み出しは、閉じていてカウンタが 0 の状態として扱う。
///
/// `try_open` / `try_claim_trial` / `close_and_reset` は複数のブレーカーが同じ状態を
/// 共有しても整合するよう、実装側で原子的に行うこと。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// サービスの状態領域を用意する（既に存在する場合は何もしない）
    async fn register_service(&self, service: &str) -> Result<(), StateStoreError>;
    async fn is_open(&self, service: &str) -> Result<bool, StateStoreError>;
    async fn set_circuit_is_open(&self, service: &str, open: bool) -> Result<(), StateStoreError>;
    async fn get_open_timestamp(
        &self,
        service: &str,
    ) -> Result<Option<DateTime<Utc>>, StateStoreError>;
    async fn set_open_timestamp(
        &self,
        service: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StateStoreError>;
    async fn get_total_requests(&self, service: &str) -> Result<u64, StateStoreError>;
    async fn get_error_percentage(&self, service: &str) -> Result<f64, StateStoreError>;
    async fn add_success(&self, service: &str) -> Result<(), StateStoreError>;
    async fn add_failure(&self, service: &str) -> Result<(), StateStoreError>;
    /// 統計のみをリセットする。サーキットを閉じる場合は `close_and_reset` を使うこと
    async fn reset_request_stats(&self, service: &str) -> Result<(), StateStoreError>;

    /// 閉じていればオープンにして `opened_at = now` を記録する。遷移させた場合のみ true
    async fn try_open(&self, service: &str, now: DateTime<Utc>) -> Result<bool, StateStoreError>;
    /// `opened_at` が `observed` のままであれば `now` に置き換える (CAS)。成功した呼び出し元だけが試行枠を得る
    async fn try_claim_trial(
        &self,
        service: &str,
        observed: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StateStoreError>;
    /// サーキットを閉じ、統計と `opened_at` を一度にリセットする
    async fn close_and_reset(&self, service: &str) -> Result<(), StateStoreError>;
    /// 状態全体を一貫したスナップショットとして読み出す
    async fn snapshot(&self, service: &str) -> Result<CircuitState, StateStoreError>;
}
