use std::time::Duration;

/// When the daemon slices a loaded range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceBehavior {
    /// In the group stage, ahead of the build stage.
    #[default]
    Preprocess,
    /// In the build stage, right before folding.
    JustInTime,
}

/// Exponential backoff for transient failures while building a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1 based): `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorHandlingOptions {
    /// Dead-letter and skip events whose handlers fail permanently.
    pub skip_apply_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub batch_size: u64,
    pub maximum_hopper_size: u64,
    pub slice_behavior: SliceBehavior,
    pub high_water_polling_interval: Duration,
    pub graceful_stop_timeout: Duration,
    pub retry: RetryPolicy,
    pub continuous_errors: ErrorHandlingOptions,
    pub rebuild_errors: ErrorHandlingOptions,
}

impl DaemonSettings {
    pub fn builder() -> DaemonSettingsBuilder {
        DaemonSettingsBuilder::new()
    }

    /// Reads `KASANE_*` variables on top of the defaults, after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        if let Some(value) = parsed::<u64>(&lookup, "KASANE_BATCH_SIZE")? {
            settings.batch_size = value;
        }
        if let Some(value) = parsed::<u64>(&lookup, "KASANE_MAXIMUM_HOPPER_SIZE")? {
            settings.maximum_hopper_size = value;
        }
        if let Some(value) = lookup("KASANE_SLICE_BEHAVIOR") {
            settings.slice_behavior = match value.to_ascii_lowercase().as_str() {
                "preprocess" => SliceBehavior::Preprocess,
                "just_in_time" | "justintime" => SliceBehavior::JustInTime,
                _ => {
                    return Err(ConfigError::InvalidVariable {
                        key: "KASANE_SLICE_BEHAVIOR",
                        value,
                    })
                }
            };
        }
        if let Some(value) = parsed::<u64>(&lookup, "KASANE_HIGH_WATER_POLLING_MS")? {
            settings.high_water_polling_interval = Duration::from_millis(value);
        }
        if let Some(value) = parsed::<u64>(&lookup, "KASANE_GRACEFUL_STOP_MS")? {
            settings.graceful_stop_timeout = Duration::from_millis(value);
        }
        if let Some(value) = parsed::<u32>(&lookup, "KASANE_RETRY_ATTEMPTS")? {
            settings.retry.max_attempts = value;
        }
        if let Some(value) = parsed::<bool>(&lookup, "KASANE_SKIP_APPLY_ERRORS")? {
            settings.continuous_errors.skip_apply_errors = value;
        }
        if let Some(value) = parsed::<bool>(&lookup, "KASANE_SKIP_APPLY_ERRORS_ON_REBUILD")? {
            settings.rebuild_errors.skip_apply_errors = value;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfiguration("batch size must be positive".to_string()));
        }
        if self.maximum_hopper_size < self.batch_size {
            return Err(ConfigError::InvalidConfiguration(
                "maximum hopper size cannot be smaller than the batch size".to_string(),
            ));
        }
        if self.high_water_polling_interval.is_zero() {
            return Err(ConfigError::InvalidConfiguration(
                "high water polling interval must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfiguration("retry needs at least one attempt".to_string()));
        }
        Ok(())
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVariable { key, value }),
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            maximum_hopper_size: 5000,
            slice_behavior: SliceBehavior::Preprocess,
            high_water_polling_interval: Duration::from_secs(1),
            graceful_stop_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            continuous_errors: ErrorHandlingOptions { skip_apply_errors: true },
            rebuild_errors: ErrorHandlingOptions {
                skip_apply_errors: false,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct DaemonSettingsBuilder {
    settings: DaemonSettings,
}

impl DaemonSettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, size: u64) -> Self {
        self.settings.batch_size = size;
        self
    }

    pub fn maximum_hopper_size(mut self, size: u64) -> Self {
        self.settings.maximum_hopper_size = size;
        self
    }

    pub fn slice_behavior(mut self, behavior: SliceBehavior) -> Self {
        self.settings.slice_behavior = behavior;
        self
    }

    pub fn high_water_polling_interval(mut self, interval: Duration) -> Self {
        self.settings.high_water_polling_interval = interval;
        self
    }

    pub fn graceful_stop_timeout(mut self, timeout: Duration) -> Self {
        self.settings.graceful_stop_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.settings.retry = retry;
        self
    }

    pub fn skip_apply_errors(mut self, skip: bool) -> Self {
        self.settings.continuous_errors.skip_apply_errors = skip;
        self
    }

    pub fn skip_apply_errors_on_rebuild(mut self, skip: bool) -> Self {
        self.settings.rebuild_errors.skip_apply_errors = skip;
        self
    }

    pub fn build(self) -> Result<DaemonSettings, ConfigError> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidVariable { key: &'static str, value: String },
}
