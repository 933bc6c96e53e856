//! tripwire-circuit-breaker: 外部ストアで状態を共有するサーキットブレーカー。
//!
//! 判定ロジック (`Breaker`) と可変状態の保持 (`StateStore`) を分離し、
//! 同じストアを共有する複数のプロセス・インスタンス間で同一のサーキットを観測できるようにする。

pub mod breaker;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
#[cfg(feature = "redis")]
pub mod redis;
pub mod state;
pub mod store;

pub use breaker::{Breaker, BreakerBuilder, Fallback, Outcome};
pub use config::{BreakerConfig, BreakerConfigOverrides};
pub use error::{BoxError, BreakerError, CallError, ConfigError, StateStoreError};
pub use memory::InMemoryStateStore;
pub use metrics::BreakerMetrics;
#[cfg(feature = "redis")]
pub use self::redis::RedisStateStore;
pub use state::CircuitState;
pub use store::StateStore;

#[cfg(feature = "mock")]
pub use store::MockStateStore;
