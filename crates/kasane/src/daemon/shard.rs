use chrono::{DateTime, Utc};
use std::fmt;

pub const ALL_SHARDS: &str = "All";

/// Identity of one independently progressing shard of a projection.
///
/// Rendered as `Name:Key`, or `Name:V{n}:Key` once the projection version passes 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardName {
    projection: String,
    key: String,
    version: u32,
    identity: String,
}

impl ShardName {
    pub fn new(projection: impl Into<String>, key: impl Into<String>, version: u32) -> Self {
        let projection = projection.into();
        let key = key.into();
        let version = version.max(1);
        let identity = if version > 1 {
            format!("{projection}:V{version}:{key}")
        } else {
            format!("{projection}:{key}")
        };
        Self {
            projection,
            key,
            version,
            identity,
        }
    }

    /// The single shard of a projection that is not split.
    pub fn all(projection: impl Into<String>, version: u32) -> Self {
        Self::new(projection, ALL_SHARDS, version)
    }

    /// Parses `Name:Key` or `Name:V{n}:Key`.
    pub fn parse(identity: &str) -> Option<Self> {
        let parts: Vec<&str> = identity.split(':').collect();
        match parts.as_slice() {
            [projection, key] if !projection.is_empty() && !key.is_empty() => Some(Self::new(*projection, *key, 1)),
            [projection, version, key] => {
                let version = version.strip_prefix('V')?.parse::<u32>().ok()?;
                Some(Self::new(*projection, *key, version))
            }
            _ => None,
        }
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    /// Failed and waiting for a restart; position is kept.
    Paused { at: DateTime<Utc> },
    /// Stopped on request, or permanently after a progress conflict.
    Stopped,
}

impl AgentStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn paused_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Paused { at } => Some(*at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_includes_version_only_past_one() {
        assert_eq!(ShardName::all("Trips", 1).identity(), "Trips:All");
        assert_eq!(ShardName::all("Trips", 2).identity(), "Trips:V2:All");
        assert_eq!(ShardName::new("Trips", "blue", 0).version(), 1);
    }

    #[test]
    fn test_parse() {
        assert_eq!(ShardName::parse("Trips:All"), Some(ShardName::all("Trips", 1)));
        assert_eq!(ShardName::parse("Trips:V3:All"), Some(ShardName::all("Trips", 3)));
        assert_eq!(ShardName::parse("Trips"), None);
        assert_eq!(ShardName::parse("Trips:Three:All"), None);
    }

    #[test]
    fn test_paused_at() {
        let now = Utc::now();
        assert_eq!(AgentStatus::Paused { at: now }.paused_at(), Some(now));
        assert_eq!(AgentStatus::Running.paused_at(), None);
    }
}
