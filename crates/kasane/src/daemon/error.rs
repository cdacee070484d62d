use crate::aggregation::AggregationError;
use crate::config::ConfigError;
use crate::daemon::command::CommandOutOfOrder;
use crate::dispatch::InvalidProjection;
use crate::event::Sequence;
use crate::persist::PersistenceError;
use crate::progress::ProgressTimeout;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Another process moved this shard's progress; the agent stops for good.
    #[error("progress for {shard} moved underneath the agent: expected {expected}, found {actual:?}")]
    ProgressOutOfOrder {
        shard: String,
        expected: Sequence,
        actual: Option<Sequence>,
    },
    /// The agent's own command stream broke its ordering; the agent stops for good.
    #[error("shard {shard}: {source}")]
    CommandOutOfOrder {
        shard: String,
        #[source]
        source: CommandOutOfOrder,
    },
    #[error(transparent)]
    Timeout(#[from] ProgressTimeout),
    #[error("unknown shard {0}")]
    UnknownShard(String),
    #[error("unknown projection {0}")]
    UnknownProjection(String),
    #[error("agent for {0} is not running")]
    AgentNotRunning(String),
    #[error("{0} was cancelled")]
    Cancelled(String),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    InvalidProjection(#[from] InvalidProjection),
    #[error(transparent)]
    Aggregation(AggregationError),
    #[error(transparent)]
    Persistence(PersistenceError),
}

impl DaemonError {
    pub fn is_out_of_order(&self) -> bool {
        matches!(self, Self::ProgressOutOfOrder { .. } | Self::CommandOutOfOrder { .. })
    }
}

impl From<PersistenceError> for DaemonError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::ProgressOutOfOrder {
                shard,
                expected,
                actual,
            } => Self::ProgressOutOfOrder {
                shard,
                expected,
                actual,
            },
            other => Self::Persistence(other),
        }
    }
}

impl From<AggregationError> for DaemonError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::Persistence(err) => err.into(),
            other => Self::Aggregation(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_is_lifted_from_nested_errors() {
        let err: DaemonError = AggregationError::Persistence(PersistenceError::ProgressOutOfOrder {
            shard: "Trips:All".to_string(),
            expected: 5,
            actual: Some(9),
        })
        .into();
        assert!(err.is_out_of_order());

        let err: DaemonError = PersistenceError::Conflict("stale".to_string()).into();
        assert!(!err.is_out_of_order());
    }

    #[test]
    fn test_command_ordering_failure_is_out_of_order() {
        use crate::daemon::command::{Command, Counters};

        let mut counters = Counters {
            last_enqueued: 10,
            last_committed: 0,
            high_water_mark: 20,
        };
        let source = counters.apply(Command::RangeCompleted(50)).unwrap_err();
        let err = DaemonError::CommandOutOfOrder {
            shard: "Trips:All".to_string(),
            source,
        };

        assert!(err.is_out_of_order());
        assert!(err.to_string().starts_with("shard Trips:All: RangeCompleted(50)"));
    }
}
