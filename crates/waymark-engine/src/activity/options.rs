//! Activity execution options

use std::time::Duration;

use serde::{Deserialize, Serialize};
use waymark_model::FailUrgency;

/// Options for activity execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// What an unhandled failure of this activity does to its surroundings
    pub fail_urgency: FailUrgency,

    /// Maximum time for one invocation of the activity body
    #[serde(with = "option_duration_serde")]
    pub max_execution_time: Option<Duration>,

    /// Priority forwarded to the async request service (0.0 - 1.0) when an
    /// outbound call is redirected
    pub async_priority: f64,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            fail_urgency: FailUrgency::default(),
            max_execution_time: None,
            async_priority: 0.5,
        }
    }
}

impl ActivityOptions {
    /// Set the fail urgency
    pub fn with_fail_urgency(mut self, urgency: FailUrgency) -> Self {
        self.fail_urgency = urgency;
        self
    }

    /// Bound the execution time of one body invocation
    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = Some(limit);
        self
    }

    /// Set the async-request priority (clamped to 0.0 - 1.0)
    pub fn with_async_priority(mut self, priority: f64) -> Self {
        self.async_priority = priority.clamp(0.0, 1.0);
        self
    }
}

/// Serde support for Option<Duration> (as milliseconds)
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
