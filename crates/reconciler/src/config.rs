//! Controller configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::GroupName;

/// Environment variable that overrides the watched group.
pub const TARGET_GROUP_ENV: &str = "TARGET_GROUP_NAME";

/// Group watched when no override is given.
pub const DEFAULT_TARGET_GROUP: &str = "redhat-ai-dev-users";

/// Default resync period: ten minutes.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(600);

/// Default capacity of the event queue between observer and loop.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

/// Resolve the target group from an optional override.
///
/// Missing or blank overrides fall back to [`DEFAULT_TARGET_GROUP`]; any
/// other value is used exactly as given.
#[must_use]
pub fn resolve_target_group(value: Option<&str>) -> GroupName {
    value
        .filter(|v| !v.trim().is_empty())
        .map_or_else(|| GroupName::from(DEFAULT_TARGET_GROUP), GroupName::from)
}

/// Configuration injected into the control loop at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// The one group whose membership is reconciled.
    #[serde(default = "default_target_group")]
    pub target_group: GroupName,

    /// How often unchanged state is redelivered.
    #[serde(default = "default_resync_period", with = "duration_secs")]
    pub resync_period: Duration,

    /// Bound of the observer → loop event queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target_group: default_target_group(),
            resync_period: default_resync_period(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl ControllerConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target group.
    #[must_use]
    pub fn with_target_group(mut self, group: impl Into<GroupName>) -> Self {
        self.target_group = group.into();
        self
    }

    /// Set the resync period.
    #[must_use]
    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Set the event queue capacity.
    #[must_use]
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a blank group name, a zero resync
    /// period or a zero queue capacity.
    pub fn validate(&self) -> Result<()> {
        if self.target_group.as_str().trim().is_empty() {
            return Err(Error::invalid_config("target group name is empty"));
        }
        if self.resync_period.is_zero() {
            return Err(Error::invalid_config("resync period must be positive"));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::invalid_config("event queue capacity must be positive"));
        }
        Ok(())
    }
}

fn default_target_group() -> GroupName {
    GroupName::from(DEFAULT_TARGET_GROUP)
}

const fn default_resync_period() -> Duration {
    DEFAULT_RESYNC_PERIOD
}

const fn default_event_queue_capacity() -> usize {
    DEFAULT_EVENT_QUEUE_CAPACITY
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
