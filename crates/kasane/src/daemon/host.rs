use crate::aggregation::ExecutionMode;
use crate::config::DaemonSettings;
use crate::daemon::agent::{Completion, ShardAgent};
use crate::daemon::error::{DaemonError, Result};
use crate::daemon::high_water::HighWaterAgent;
use crate::daemon::shard::{AgentStatus, ShardName};
use crate::event::Sequence;
use crate::progress::{ProgressTimeout, ShardState, ShardStateTracker};
use crate::projection::{Projection, ProjectionLifecycle};
use crate::storage::DaemonStorage;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Where to move a shard's progress to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindTarget {
    Sequence(Sequence),
    /// The last sequence recorded at or before this time.
    Timestamp(DateTime<Utc>),
}

struct Registered {
    projection: Arc<dyn Projection>,
    type_name: &'static str,
}

#[derive(Default)]
struct Registry {
    projections: BTreeMap<String, Registered>,
    agents: HashMap<String, ShardAgent>,
    high_water: Option<HighWaterAgent>,
}

impl Registry {
    fn projection(&self, name: &str) -> Result<Arc<dyn Projection>> {
        self.projections
            .get(name)
            .or_else(|| self.projections.values().find(|r| r.type_name == name))
            .map(|r| r.projection.clone())
            .ok_or_else(|| DaemonError::UnknownProjection(name.to_string()))
    }

    fn shard(&self, identity: &str) -> Result<(Arc<dyn Projection>, ShardName)> {
        self.projections
            .values()
            .find_map(|r| {
                r.projection
                    .shards()
                    .into_iter()
                    .find(|shard| shard.identity() == identity)
                    .map(|shard| (r.projection.clone(), shard))
            })
            .ok_or_else(|| DaemonError::UnknownShard(identity.to_string()))
    }
}

/// Hosts the asynchronous projections of one store: one agent per shard, plus the high-water agent.
pub struct ProjectionDaemon {
    storage: DaemonStorage,
    settings: DaemonSettings,
    tracker: ShardStateTracker,
    registry: Mutex<Registry>,
}

impl ProjectionDaemon {
    pub fn new(storage: DaemonStorage, settings: DaemonSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            storage,
            settings,
            tracker: ShardStateTracker::new(),
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn tracker(&self) -> &ShardStateTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Registers a projection after checking it is valid. Only async projections get agents.
    pub async fn add_projection<P: Projection>(&self, projection: P) -> Result<()> {
        projection.assert_validity()?;
        let name = projection.name().to_string();
        info!(projection = %name, lifecycle = ?projection.lifecycle(), "projection registered");
        self.registry.lock().await.projections.insert(
            name,
            Registered {
                projection: Arc::new(projection),
                type_name: std::any::type_name::<P>(),
            },
        );
        Ok(())
    }

    /// Rebuilds the projection registered under the type `P`.
    pub async fn rebuild<P: Projection>(&self, timeout: Duration) -> Result<()> {
        self.rebuild_projection(std::any::type_name::<P>(), timeout).await
    }

    pub async fn start_all(&self) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.high_water.is_none() {
            registry.high_water = Some(HighWaterAgent::start(
                self.storage.high_water.clone(),
                self.tracker.clone(),
                self.settings.high_water_polling_interval,
            ));
        }
        let shards: Vec<(Arc<dyn Projection>, ShardName)> = registry
            .projections
            .values()
            .filter(|r| r.projection.lifecycle() == ProjectionLifecycle::Async)
            .flat_map(|r| r.projection.shards().into_iter().map(|s| (r.projection.clone(), s)))
            .collect();
        for (projection, shard) in shards {
            if registry.agents.contains_key(shard.identity()) {
                continue;
            }
            let agent = self.spawn_agent(projection, shard.clone(), ExecutionMode::Continuous, None).await?;
            registry.agents.insert(shard.identity().to_string(), agent);
        }
        Ok(())
    }

    pub async fn start_agent(&self, shard: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let (projection, shard) = registry.shard(shard)?;
        if let Some(agent) = registry.agents.get(shard.identity()) {
            if agent.status().is_running() {
                return Ok(());
            }
        }
        if let Some(stale) = registry.agents.remove(shard.identity()) {
            stale.kill();
        }
        let agent = self.spawn_agent(projection, shard.clone(), ExecutionMode::Continuous, None).await?;
        registry.agents.insert(shard.identity().to_string(), agent);
        Ok(())
    }

    pub async fn stop_agent(&self, shard: &str) -> Result<()> {
        let agent = self
            .registry
            .lock()
            .await
            .agents
            .remove(shard)
            .ok_or_else(|| DaemonError::AgentNotRunning(shard.to_string()))?;
        agent.stop(self.settings.graceful_stop_timeout).await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let mut registry = self.registry.lock().await;
        let agents: Vec<ShardAgent> = registry.agents.drain().map(|(_, agent)| agent).collect();
        let grace = self.settings.graceful_stop_timeout;
        futures::future::join_all(agents.into_iter().map(|agent| agent.stop(grace))).await;
        if let Some(high_water) = registry.high_water.take() {
            high_water.stop().await;
        }
        info!("projection daemon stopped");
    }

    /// Stops the shard's agent, paused or not, and starts a fresh one from its stored progress.
    pub async fn restart_agent(&self, shard: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let (projection, shard) = registry.shard(shard)?;
        if let Some(agent) = registry.agents.remove(shard.identity()) {
            agent.stop(self.settings.graceful_stop_timeout).await;
        }
        let agent = self.spawn_agent(projection, shard.clone(), ExecutionMode::Continuous, None).await?;
        registry.agents.insert(shard.identity().to_string(), agent);
        Ok(())
    }

    /// Tears down the projection's documents and progress and replays it from zero.
    ///
    /// `name` is the projection name or its Rust type name. Does nothing when the log is empty.
    /// The lifecycle lock is held throughout, so no agent can be started on these shards while
    /// the replay runs.
    pub async fn rebuild_projection(&self, name: &str, timeout: Duration) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let projection = registry.projection(name)?;
        let high_water = self.storage.high_water.detect().await?.high_water_mark;
        if high_water == 0 {
            info!(projection = %projection.name(), "nothing to rebuild; the log is empty");
            return Ok(());
        }

        let shards = projection.shards();
        let mut restart = Vec::new();
        for shard in &shards {
            if let Some(agent) = registry.agents.remove(shard.identity()) {
                agent.kill();
                restart.push(shard.clone());
            }
        }

        info!(projection = %projection.name(), high_water, "rebuild started");
        self.storage.batches.teardown_documents(projection.doc_type()).await?;
        for shard in &shards {
            self.storage.progress.delete_progress(shard.identity()).await?;
        }

        let outcome = self
            .run_to(projection.clone(), &shards, ExecutionMode::Rebuild, high_water, timeout, "rebuild")
            .await;
        info!(projection = %projection.name(), ok = outcome.is_ok(), "rebuild finished");
        outcome?;

        for shard in restart {
            let agent = self.spawn_agent(projection.clone(), shard.clone(), ExecutionMode::Continuous, None).await?;
            registry.agents.insert(shard.identity().to_string(), agent);
        }
        Ok(())
    }

    /// Replays every shard of the projection up to the current high-water mark, then stops.
    pub async fn catch_up(&self, name: &str, timeout: Duration) -> Result<()> {
        let registry = self.registry.lock().await;
        let projection = registry.projection(name)?;
        let high_water = self.storage.high_water.detect().await?.high_water_mark;
        let shards = projection.shards();
        self.run_to(projection, &shards, ExecutionMode::CatchUp, high_water, timeout, "catch up")
            .await
    }

    /// Moves the stored progress of `shard` and restarts its agent there if it was running.
    pub async fn rewind_subscription(&self, shard: &str, target: RewindTarget) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let (projection, shard) = registry.shard(shard)?;
        let sequence = match target {
            RewindTarget::Sequence(sequence) => sequence,
            RewindTarget::Timestamp(timestamp) => self.storage.events.find_sequence_at(timestamp).await?,
        };
        let running = registry.agents.remove(shard.identity());
        let was_running = running.is_some();
        if let Some(agent) = running {
            agent.stop(self.settings.graceful_stop_timeout).await;
        }
        self.storage.progress.set_progress(shard.identity(), sequence).await?;
        info!(%shard, sequence, "subscription rewound");
        if was_running {
            let agent = self.spawn_agent(projection, shard.clone(), ExecutionMode::Continuous, None).await?;
            registry.agents.insert(shard.identity().to_string(), agent);
        }
        Ok(())
    }

    pub async fn agent_statuses(&self) -> BTreeMap<String, AgentStatus> {
        self.registry
            .lock()
            .await
            .agents
            .iter()
            .map(|(shard, agent)| (shard.clone(), agent.status()))
            .collect()
    }

    pub async fn wait_for_shard(&self, shard: &str, sequence: Sequence, timeout: Duration) -> Result<ShardState> {
        Ok(self.tracker.wait_for_shard_state(shard, sequence, timeout).await?)
    }

    /// Waits until every running shard has reached the log's current high-water mark.
    pub async fn wait_for_non_stale_data(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let high_water = self.storage.high_water.detect().await?.high_water_mark;
        let shards: Vec<String> = self.registry.lock().await.agents.keys().cloned().collect();
        for shard in shards {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.tracker.wait_for_shard_state(&shard, high_water, remaining).await?;
        }
        Ok(())
    }

    async fn spawn_agent(
        &self,
        projection: Arc<dyn Projection>,
        shard: ShardName,
        mode: ExecutionMode,
        target: Option<Sequence>,
    ) -> Result<ShardAgent> {
        ShardAgent::start(
            projection,
            shard,
            self.storage.clone(),
            self.settings.clone(),
            self.tracker.clone(),
            mode,
            target,
        )
        .await
    }

    /// Runs a bounded agent per shard until each reaches `high_water`.
    async fn run_to(
        &self,
        projection: Arc<dyn Projection>,
        shards: &[ShardName],
        mode: ExecutionMode,
        high_water: Sequence,
        timeout: Duration,
        what: &str,
    ) -> Result<()> {
        let mut agents = Vec::with_capacity(shards.len());
        let mut completions: Vec<Completion> = Vec::with_capacity(shards.len());
        for shard in shards {
            let mut agent = self
                .spawn_agent(projection.clone(), shard.clone(), mode, Some(high_water))
                .await?;
            if let Some(completion) = agent.take_completion() {
                completions.push(completion);
            }
            agents.push(agent);
        }

        let waited = tokio::time::timeout(timeout, futures::future::join_all(completions)).await;
        let grace = self.settings.graceful_stop_timeout;
        let outcome = match waited {
            Err(_) => {
                for agent in agents {
                    agent.kill();
                }
                return Err(ProgressTimeout {
                    waiting_for: format!("{what} of {} to reach {high_water}", projection.name()),
                    timeout,
                    failures: self.tracker.failures(),
                }
                .into());
            }
            Ok(results) => results.into_iter().try_for_each(|result| match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(DaemonError::Cancelled(format!("{what} of {}", projection.name()))),
            }),
        };
        futures::future::join_all(agents.into_iter().map(|agent| agent.stop(grace))).await;
        outcome
    }
}

impl std::fmt::Debug for ProjectionDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionDaemon")
            .field("settings", &self.settings)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}
