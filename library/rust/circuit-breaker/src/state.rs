use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// サービス単位のサーキット状態。ストアが所有し、`StateStore` の操作でのみ変更される。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub is_open: bool,
    /// オープン時、または試行リクエストを払い出した時刻
    pub opened_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl CircuitState {
    /// リクエストが無い場合は 0.0 を返す。
    pub fn error_percentage(&self) -> f64 {
        error_percentage(self.failure_count, self.total_requests)
    }

    pub(crate) fn record_success(&mut self) {
        self.total_requests += 1;
        self.success_count += 1;
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failure_count += 1;
    }

    pub(crate) fn reset_stats(&mut self) {
        self.total_requests = 0;
        self.success_count = 0;
        self.failure_count = 0;
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn error_percentage(failures: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    failures as f64 / total as f64 * 100.0
}
