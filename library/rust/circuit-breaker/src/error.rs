use thiserror::Error;

/// 保護対象の操作が返す任意のエラー。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// フォールバックに渡される呼び出し失敗の理由。
#[derive(Debug, Error)]
pub enum CallError {
    /// ブレーカーが呼び出しを遮断した（下流のエラーは存在しない）。
    #[error("service '{service}' is short-circuited")]
    ShortCircuited { service: String },
    /// 許可された呼び出しが失敗した。`source()` で元のエラーを参照できる。
    #[error("service '{service}' failed: {source}")]
    Operation {
        service: String,
        #[source]
        source: BoxError,
    },
}

impl CallError {
    pub fn service(&self) -> &str {
        match self {
            Self::ShortCircuited { service } | Self::Operation { service, .. } => service,
        }
    }

    pub fn is_short_circuited(&self) -> bool {
        matches!(self, Self::ShortCircuited { .. })
    }
}

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("no fallback configured: {0}")]
    NoFallback(CallError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("接続エラー: {0}")]
    Connection(String),
    #[error("サーキット状態が破損しています: service={service}, {detail}")]
    Corrupted { service: String, detail: String },
}
