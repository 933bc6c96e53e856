use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::CircuitState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub service: String,
    pub is_open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_percentage: f64,
}

impl BreakerMetrics {
    pub(crate) fn from_state(service: &str, state: &CircuitState) -> Self {
        Self {
            service: service.to_string(),
            is_open: state.is_open,
            opened_at: state.opened_at,
            total_requests: state.total_requests,
            success_count: state.success_count,
            failure_count: state.failure_count,
            error_percentage: state.error_percentage(),
        }
    }
}
