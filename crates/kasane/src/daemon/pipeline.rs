//! The load, group and build stages of a shard agent.
//!
//! Each stage is one task reading one range at a time from its channel, so ranges leave the
//! build stage, and commit, in the order they were requested.

use crate::aggregation::{self, ExecutionMode};
use crate::config::SliceBehavior;
use crate::daemon::agent::AgentShared;
use crate::daemon::command::Command;
use crate::daemon::error::{DaemonError, Result};
use crate::daemon::range::EventRange;
use crate::dispatch::ApplyContext;
use crate::event::{Sequence, DEFAULT_TENANT};
use crate::persist::PersistenceError;
use crate::projection::ApplyStats;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) type LoadRequest = (Sequence, Sequence);

pub(crate) struct Pipeline {
    pub(crate) requests: mpsc::Sender<LoadRequest>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

pub(crate) fn spawn(shared: Arc<AgentShared>, commands: mpsc::UnboundedSender<Command>) -> Pipeline {
    let capacity = (shared.settings.maximum_hopper_size / shared.settings.batch_size.max(1)).max(1) as usize;
    let (requests, load_rx) = mpsc::channel(capacity);
    let (group_tx, group_rx) = mpsc::channel(capacity);
    let (build_tx, build_rx) = mpsc::channel(capacity);
    let tasks = vec![
        tokio::spawn(load_stage(shared.clone(), load_rx, group_tx)),
        tokio::spawn(group_stage(shared.clone(), group_rx, build_tx)),
        tokio::spawn(build_stage(shared, build_rx, commands)),
    ];
    Pipeline { requests, tasks }
}

async fn load_stage(shared: Arc<AgentShared>, mut rx: mpsc::Receiver<LoadRequest>, tx: mpsc::Sender<EventRange>) {
    while let Some((floor, ceiling)) = rx.recv().await {
        let loaded = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            loaded = load(&shared, floor, ceiling) => loaded,
        };
        match loaded {
            Ok(range) => {
                debug!(shard = %shared.shard, floor, ceiling, events = range.events.len(), "loaded event range");
                if tx.send(range).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                shared.fail(err);
                break;
            }
        }
    }
}

async fn load(shared: &AgentShared, floor: Sequence, ceiling: Sequence) -> Result<EventRange> {
    let retry = shared.settings.retry;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match shared.storage.events.load_events(&shared.filter, floor, ceiling).await {
            Ok(events) => return Ok(EventRange::new(shared.shard.clone(), floor, ceiling, events)),
            Err(PersistenceError::ConnectionError(err)) if attempt < retry.max_attempts => {
                warn!(shard = %shared.shard, attempt, error = %err, "retrying event load");
                tokio::time::sleep(retry.delay_for(attempt)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn group_stage(shared: Arc<AgentShared>, mut rx: mpsc::Receiver<EventRange>, tx: mpsc::Sender<EventRange>) {
    while let Some(mut range) = rx.recv().await {
        if shared.settings.slice_behavior == SliceBehavior::Preprocess {
            let sliced = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                sliced = shared
                    .projection
                    .clone()
                    .slice(range.events.clone(), shared.storage.documents.clone()) => sliced,
            };
            match sliced {
                Ok(sliced) => range.sliced = Some(sliced),
                // Slicing is retried by the build stage, which re-slices whatever is unsliced.
                Err(err) if err.is_transient() => {
                    warn!(shard = %shared.shard, error = %err, "slicing failed; deferring to build");
                }
                Err(err) => {
                    shared.fail(err.into());
                    break;
                }
            }
        }
        if tx.send(range).await.is_err() {
            break;
        }
    }
}

async fn build_stage(shared: Arc<AgentShared>, mut rx: mpsc::Receiver<EventRange>, commands: mpsc::UnboundedSender<Command>) {
    while let Some(mut range) = rx.recv().await {
        if shared.cancel.is_cancelled() {
            break;
        }
        match build(&shared, &mut range).await {
            Ok(stats) => {
                shared.committed(range.ceiling);
                debug!(
                    shard = %shared.shard,
                    ceiling = range.ceiling,
                    slices = stats.slices,
                    operations = stats.operations,
                    dead_letters = range.dead_letters.len(),
                    "committed event range"
                );
                // Keep committing what is queued even once nobody listens for completions.
                if commands.send(Command::RangeCompleted(range.ceiling)).is_err() {
                    debug!(shard = %shared.shard, ceiling = range.ceiling, "command task gone; completion not reported");
                }
            }
            Err(err) => {
                shared.fail(err);
                break;
            }
        }
    }
}

/// Builds and commits one range, retrying transient failures and, when enabled,
/// dead-lettering events that fail permanently.
pub(crate) async fn build(shared: &AgentShared, range: &mut EventRange) -> Result<ApplyStats> {
    let retry = shared.settings.retry;
    let skip = shared.skip_apply_errors();
    let mut attempt = 0;
    loop {
        if shared.cancel.is_cancelled() {
            return Err(DaemonError::Cancelled(shared.shard.to_string()));
        }
        attempt += 1;
        let err = match try_build(shared, range).await {
            Ok(stats) => return Ok(stats),
            Err(err) => err,
        };
        if err.is_transient() && attempt < retry.max_attempts {
            warn!(shard = %shared.shard, attempt, error = %err, "retrying range build");
            tokio::select! {
                _ = shared.cancel.cancelled() => {}
                _ = tokio::time::sleep(retry.delay_for(attempt)) => {}
            }
            continue;
        }
        match err.failed_event().cloned() {
            Some(event) if skip => {
                warn!(
                    shard = %shared.shard,
                    sequence = event.sequence(),
                    event_type = %event.event_type(),
                    error = %err,
                    "skipping event after permanent failure"
                );
                range.skip_event(&event, &err);
                attempt = 0;
            }
            _ => return Err(err.into()),
        }
    }
}

async fn try_build(shared: &AgentShared, range: &mut EventRange) -> aggregation::Result<ApplyStats> {
    let sliced = match range.sliced.take() {
        Some(sliced) => sliced,
        None => {
            shared
                .projection
                .clone()
                .slice(range.events.clone(), shared.storage.documents.clone())
                .await?
        }
    };
    let mut batch = shared.storage.batches.start_batch().await?;
    let ctx = ApplyContext::new(DEFAULT_TENANT, shared.storage.documents.clone(), shared.cancel.clone());
    let stats = sliced.apply(batch.as_mut(), &ctx, shared.mode).await?;
    for letter in &range.dead_letters {
        batch.dead_letter(letter.clone());
    }
    batch.mark_progress(shared.shard.identity(), range.floor, range.ceiling);
    batch.execute().await?;
    Ok(stats)
}

impl AgentShared {
    pub(crate) fn skip_apply_errors(&self) -> bool {
        match self.mode {
            ExecutionMode::Continuous => self.settings.continuous_errors.skip_apply_errors,
            ExecutionMode::Rebuild | ExecutionMode::CatchUp => self.settings.rebuild_errors.skip_apply_errors,
        }
    }
}
