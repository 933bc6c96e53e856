use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, BreakerConfigOverrides};
use crate::error::{BoxError, BreakerError, CallError, ConfigError};
use crate::metrics::BreakerMetrics;
use crate::store::StateStore;

/// 遮断時・失敗時に呼び出されるフォールバック。
pub type Fallback = Arc<dyn Fn(CallError) + Send + Sync>;

/// `execute` の結果。
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// 操作が実行され成功した
    Executed(T),
    /// サーキットが開いていたため操作を実行せず、フォールバックを呼び出した
    ShortCircuited,
    /// 操作が失敗し、フォールバックを呼び出した
    FailedWithFallback,
}

impl<T> Outcome<T> {
    pub fn is_short_circuited(&self) -> bool {
        matches!(self, Self::ShortCircuited)
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Executed(value) => Some(value),
            _ => None,
        }
    }
}

/// サービス単位のサーキットブレーカー。
///
/// 自身は不変の設定とストアへの参照だけを持ち、可変状態はすべて `StateStore` が保持する。
/// 同じストアとサービス名を共有するブレーカー同士は同じサーキットを観測する。
pub struct Breaker {
    service: String,
    config: BreakerConfig,
    store: Arc<dyn StateStore>,
    fallback: Option<Fallback>,
}

impl Breaker {
    pub fn builder(service: impl Into<String>, store: Arc<dyn StateStore>) -> BreakerBuilder {
        BreakerBuilder {
            service: service.into(),
            store,
            config: BreakerConfig::default(),
            fallback: None,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// サーキットが開いているかを返す。
    ///
    /// 閉じていてもしきい値を超えていればここでオープンへ遷移させるため、副作用を持つ。
    pub async fn is_open(&self) -> Result<bool, BreakerError> {
        if self.store.is_open(&self.service).await? {
            return Ok(true);
        }

        let total = self.store.get_total_requests(&self.service).await?;
        if total < u64::from(self.config.request_count_threshold) {
            return Ok(false);
        }

        let error_percentage = self.store.get_error_percentage(&self.service).await?;
        if error_percentage < self.config.allowed_error_percentage {
            return Ok(false);
        }

        // 別のブレーカーが先に遷移させた場合でもオープンとして扱う
        if self.store.try_open(&self.service, Utc::now()).await? {
            warn!(
                service = %self.service,
                error_percentage,
                total_requests = total,
                "circuit opened"
            );
        }
        Ok(true)
    }

    pub async fn allow_request(&self) -> Result<bool, BreakerError> {
        if !self.is_open().await? {
            return Ok(true);
        }
        self.allow_trial_request().await
    }

    /// 待機時間が経過していれば試行枠の獲得を試みる。同じ待機窓で true を得るのは一呼び出し元のみ。
    pub async fn allow_trial_request(&self) -> Result<bool, BreakerError> {
        let Some(opened_at) = self.store.get_open_timestamp(&self.service).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let elapsed_ms = now.signed_duration_since(opened_at).num_milliseconds();
        if elapsed_ms <= self.config.test_wait_millis() {
            return Ok(false);
        }

        let claimed = self
            .store
            .try_claim_trial(&self.service, opened_at, now)
            .await?;
        if claimed {
            info!(service = %self.service, elapsed_ms, "trial request dispatched");
        }
        Ok(claimed)
    }

    /// 操作をブレーカー越しに実行する。
    ///
    /// 実行した試行ごとに成功・失敗のどちらかを一度だけ記録する。遮断した呼び出しは記録しない。
    /// フォールバックが未設定の場合、遮断・失敗はいずれも `BreakerError::NoFallback` になる。
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<Outcome<T>, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if !self.allow_request().await? {
            debug!(service = %self.service, "call short-circuited");
            self.execute_fallback(None)?;
            return Ok(Outcome::ShortCircuited);
        }

        // 操作の実行後は記録に失敗しても結果・エラーを呼び出し元へ返す
        match operation().await {
            Ok(value) => {
                if let Err(e) = self.record_success().await {
                    warn!(service = %self.service, error = %e, "failed to record success");
                }
                Ok(Outcome::Executed(value))
            }
            Err(e) => {
                let error: BoxError = e.into();
                warn!(service = %self.service, error = %error, "protected call failed");
                if let Err(e) = self.store.add_failure(&self.service).await {
                    warn!(service = %self.service, error = %e, "failed to record failure");
                }
                self.execute_fallback(Some(error))?;
                Ok(Outcome::FailedWithFallback)
            }
        }
    }

    async fn record_success(&self) -> Result<(), BreakerError> {
        if self.store.is_open(&self.service).await? {
            self.store.close_and_reset(&self.service).await?;
            info!(service = %self.service, "trial request succeeded, circuit closed");
        }
        self.store.add_success(&self.service).await?;
        Ok(())
    }

    /// フォールバックを呼び出す。`error` が None の場合は遮断として扱う。
    pub fn execute_fallback(&self, error: Option<BoxError>) -> Result<(), BreakerError> {
        let cause = match error {
            Some(source) => CallError::Operation {
                service: self.service.clone(),
                source,
            },
            None => CallError::ShortCircuited {
                service: self.service.clone(),
            },
        };

        match &self.fallback {
            Some(fallback) => {
                fallback(cause);
                Ok(())
            }
            None => Err(BreakerError::NoFallback(cause)),
        }
    }

    pub async fn metrics(&self) -> Result<BreakerMetrics, BreakerError> {
        let state = self.store.snapshot(&self.service).await?;
        Ok(BreakerMetrics::from_state(&self.service, &state))
    }
}

pub struct BreakerBuilder {
    service: String,
    store: Arc<dyn StateStore>,
    config: BreakerConfig,
    fallback: Option<Fallback>,
}

impl BreakerBuilder {
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn overrides(mut self, overrides: &BreakerConfigOverrides) -> Self {
        self.config = self.config.with_overrides(overrides);
        self
    }

    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(CallError) + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// 設定を検証し、ストアにサービスを登録してからブレーカーを返す。
    pub async fn build(self) -> Result<Breaker, BreakerError> {
        if self.service.is_empty() {
            return Err(ConfigError::Validation("service name is required".into()).into());
        }
        self.config.validate()?;
        self.store.register_service(&self.service).await?;

        Ok(Breaker {
            service: self.service,
            config: self.config,
            store: self.store,
            fallback: self.fallback,
        })
    }
}
