use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_REQUEST_COUNT_THRESHOLD: u32 = 10;
pub const DEFAULT_ALLOWED_ERROR_PERCENTAGE: f64 = 50.0;
pub const DEFAULT_TEST_WAIT: Duration = Duration::from_millis(5000);

/// ブレーカーの判定パラメータ。構築時に一度だけ検証される。
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// エラー率を評価する前に必要な最小リクエスト数
    pub request_count_threshold: u32,
    /// この値以上のエラー率 (%) でサーキットを開く
    pub allowed_error_percentage: f64,
    /// オープン後、試行リクエストを許可するまでの待機時間
    pub test_wait: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            request_count_threshold: DEFAULT_REQUEST_COUNT_THRESHOLD,
            allowed_error_percentage: DEFAULT_ALLOWED_ERROR_PERCENTAGE,
            test_wait: DEFAULT_TEST_WAIT,
        }
    }
}

/// 呼び出し側が指定する設定の上書き。指定されたフィールドだけがデフォルトを置き換える。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BreakerConfigOverrides {
    pub request_count_threshold: Option<u32>,
    pub allowed_error_percentage: Option<f64>,
    pub test_wait_milliseconds: Option<u64>,
}

impl BreakerConfig {
    pub fn with_request_count_threshold(mut self, threshold: u32) -> Self {
        self.request_count_threshold = threshold;
        self
    }

    pub fn with_allowed_error_percentage(mut self, percentage: f64) -> Self {
        self.allowed_error_percentage = percentage;
        self
    }

    pub fn with_test_wait(mut self, wait: Duration) -> Self {
        self.test_wait = wait;
        self
    }

    pub fn with_overrides(mut self, overrides: &BreakerConfigOverrides) -> Self {
        if let Some(threshold) = overrides.request_count_threshold {
            self.request_count_threshold = threshold;
        }
        if let Some(percentage) = overrides.allowed_error_percentage {
            self.allowed_error_percentage = percentage;
        }
        if let Some(wait_ms) = overrides.test_wait_milliseconds {
            self.test_wait = Duration::from_millis(wait_ms);
        }
        self
    }

    /// YAML の上書き設定をデフォルトにマージし、検証済みの設定を返す。
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config = if yaml.trim().is_empty() {
            Self::default()
        } else {
            let overrides: BreakerConfigOverrides = serde_yaml::from_str(yaml)?;
            Self::default().with_overrides(&overrides)
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_count_threshold == 0 {
            return Err(ConfigError::Validation(
                "requestCountThreshold must be >= 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.allowed_error_percentage) {
            // NaN もここで弾かれる
            return Err(ConfigError::Validation(format!(
                "allowedErrorPercentage must be within 0..=100, got {}",
                self.allowed_error_percentage
            )));
        }
        Ok(())
    }

    pub(crate) fn test_wait_millis(&self) -> i64 {
        i64::try_from(self.test_wait.as_millis()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.request_count_threshold, 10);
        assert!((config.allowed_error_percentage - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.test_wait, Duration::from_millis(5000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_apply_field_by_field() {
        let overrides = BreakerConfigOverrides {
            request_count_threshold: Some(2),
            ..Default::default()
        };
        let config = BreakerConfig::default().with_overrides(&overrides);
        assert_eq!(config.request_count_threshold, 2);
        assert!((config.allowed_error_percentage - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.test_wait, DEFAULT_TEST_WAIT);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = BreakerConfig::default().with_request_count_threshold(0);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_percentage_out_of_range_rejected() {
        for pct in [-0.5, 100.5, f64::NAN] {
            let config = BreakerConfig::default().with_allowed_error_percentage(pct);
            assert!(config.validate().is_err(), "{pct} should be rejected");
        }
        let edge = BreakerConfig::default().with_allowed_error_percentage(100.0);
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_merges_over_defaults() {
        let yaml = "requestCountThreshold: 4\ntestWaitMilliseconds: 250\n";
        let config = BreakerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.request_count_threshold, 4);
        assert!((config.allowed_error_percentage - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.test_wait, Duration::from_millis(250));
    }

    #[test]
    fn test_from_yaml_empty_gives_defaults() {
        assert_eq!(BreakerConfig::from_yaml("  \n").unwrap(), BreakerConfig::default());
    }

    #[test]
    fn test_from_yaml_rejects_unknown_field() {
        let result = BreakerConfig::from_yaml("failureThreshold: 3\n");
        assert!(matches!(result, Err(ConfigError::ParseYaml(_))));
    }

    #[test]
    fn test_from_yaml_validates() {
        let result = BreakerConfig::from_yaml("allowedErrorPercentage: 150\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
