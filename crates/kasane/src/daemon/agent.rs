use crate::aggregation::ExecutionMode;
use crate::cancel::CancelToken;
use crate::config::DaemonSettings;
use crate::daemon::command::{Command, CommandOutOfOrder, Counters};
use crate::daemon::error::{DaemonError, Result};
use crate::daemon::pipeline::{self, LoadRequest};
use crate::daemon::shard::{AgentStatus, ShardName};
use crate::dispatch::BoxError;
use crate::event::Sequence;
use crate::progress::{ShardAction, ShardState, ShardStateTracker, Subscription, HIGH_WATER_MARK};
use crate::projection::Projection;
use crate::storage::{DaemonStorage, EventFilter};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) type Completion = oneshot::Receiver<Result<Sequence>>;

/// State shared by an agent's command task and its pipeline stages.
pub(crate) struct AgentShared {
    pub(crate) projection: Arc<dyn Projection>,
    pub(crate) shard: ShardName,
    pub(crate) storage: DaemonStorage,
    pub(crate) settings: DaemonSettings,
    pub(crate) tracker: ShardStateTracker,
    pub(crate) mode: ExecutionMode,
    pub(crate) filter: EventFilter,
    pub(crate) cancel: CancelToken,
    status: Mutex<AgentStatus>,
    position: AtomicU64,
    completion: Mutex<Option<oneshot::Sender<Result<Sequence>>>>,
}

impl AgentShared {
    pub(crate) fn committed(&self, ceiling: Sequence) {
        self.position.fetch_max(ceiling, Ordering::AcqRel);
    }

    pub(crate) fn position(&self) -> Sequence {
        self.position.load(Ordering::Acquire)
    }

    /// Stops the pipeline after a critical failure.
    ///
    /// A progress conflict stops the agent for good; anything else pauses it.
    pub(crate) fn fail(&self, err: DaemonError) {
        if self.cancel.is_cancelled() {
            debug!(shard = %self.shard, error = %err, "ignoring failure after cancellation");
            return;
        }
        let (status, action) = if err.is_out_of_order() {
            (AgentStatus::Stopped, ShardAction::Stopped)
        } else {
            (AgentStatus::Paused { at: Utc::now() }, ShardAction::Paused)
        };
        error!(shard = %self.shard, ?status, error = %err, "shard agent failed");
        *self.status.lock() = status;
        self.cancel.cancel();
        self.tracker.publish(
            ShardState::new(self.shard.identity(), self.position())
                .with_action(action)
                .with_error(&err),
        );
        self.complete(Err(err));
    }

    pub(crate) fn out_of_order(&self, source: CommandOutOfOrder) -> DaemonError {
        DaemonError::CommandOutOfOrder {
            shard: self.shard.identity().to_string(),
            source,
        }
    }

    fn complete(&self, result: Result<Sequence>) {
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(result);
        }
    }
}

/// Runs one shard: a command task owning the counters, plus the load, group and build stages.
pub struct ShardAgent {
    shared: Arc<AgentShared>,
    commands: mpsc::UnboundedSender<Command>,
    tasks: Vec<JoinHandle<()>>,
    completion: Option<Completion>,
    _high_water: Option<Subscription>,
}

impl ShardAgent {
    /// Starts the agent from the shard's stored progress.
    ///
    /// `target` fixes the high-water mark to stop at; without it the mark is detected and,
    /// in continuous mode, followed as the tracker publishes new ones.
    pub(crate) async fn start(
        projection: Arc<dyn Projection>,
        shard: ShardName,
        storage: DaemonStorage,
        settings: DaemonSettings,
        tracker: ShardStateTracker,
        mode: ExecutionMode,
        target: Option<Sequence>,
    ) -> Result<Self> {
        let last_committed = storage.progress.fetch_progress(shard.identity()).await?.unwrap_or(0);
        let high_water = match target {
            Some(target) => target,
            None => storage
                .high_water
                .detect()
                .await?
                .high_water_mark
                .max(tracker.high_water_mark()),
        };
        let (completion_tx, completion_rx) = oneshot::channel();
        let shared = Arc::new(AgentShared {
            filter: projection.event_filter(),
            projection,
            shard,
            storage,
            settings,
            tracker,
            mode,
            cancel: CancelToken::new(),
            status: Mutex::new(AgentStatus::Running),
            position: AtomicU64::new(last_committed),
            completion: Mutex::new(Some(completion_tx)),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let pipeline = pipeline::spawn(shared.clone(), commands.clone());
        let mut tasks = pipeline.tasks;
        tasks.push(tokio::spawn(run_commands(shared.clone(), command_rx, pipeline.requests)));

        let _ = commands.send(Command::Started {
            high_water,
            last_committed,
        });
        let high_water_subscription = (mode == ExecutionMode::Continuous).then(|| {
            let forward = commands.clone();
            shared
                .tracker
                .subscribe(move |state: &ShardState| -> std::result::Result<(), BoxError> {
                    if state.shard == HIGH_WATER_MARK {
                        let _ = forward.send(Command::HighWaterUpdated(state.sequence));
                    }
                    Ok(())
                })
        });

        info!(shard = %shared.shard, ?mode, last_committed, high_water, "shard agent started");
        shared.tracker.publish(ShardState::new(shared.shard.identity(), last_committed).with_action(ShardAction::Started));

        Ok(Self {
            shared,
            commands,
            tasks,
            completion: Some(completion_rx),
            _high_water: high_water_subscription,
        })
    }

    pub fn shard(&self) -> &ShardName {
        &self.shared.shard
    }

    pub fn mode(&self) -> ExecutionMode {
        self.shared.mode
    }

    pub fn status(&self) -> AgentStatus {
        *self.shared.status.lock()
    }

    /// Highest sequence committed by this agent.
    pub fn position(&self) -> Sequence {
        self.shared.position()
    }

    /// Resolves when a rebuild or catch-up reaches its high-water mark, or fails.
    pub(crate) fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// Lets queued commands and in-flight ranges finish, up to `grace`, then cancels.
    pub async fn stop(mut self, grace: Duration) {
        let _ = self.commands.send(Command::Stop);
        let tasks = std::mem::take(&mut self.tasks);
        if tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_err() {
            warn!(shard = %self.shared.shard, ?grace, "shard agent did not drain in time; cancelling");
        }
        self.finish();
    }

    /// Cancels immediately, abandoning in-flight ranges.
    pub fn kill(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.shared.cancel.cancel();
        let mut status = self.shared.status.lock();
        if status.is_running() {
            *status = AgentStatus::Stopped;
        }
        drop(status);
        info!(shard = %self.shared.shard, position = self.position(), "shard agent stopped");
        self.shared.tracker.publish(
            ShardState::new(self.shared.shard.identity(), self.position()).with_action(ShardAction::Stopped),
        );
    }
}

impl std::fmt::Debug for ShardAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardAgent")
            .field("shard", &self.shared.shard.identity())
            .field("mode", &self.shared.mode)
            .field("status", &self.status())
            .field("position", &self.position())
            .finish()
    }
}

/// Owns the counters and feeds load requests to the pipeline.
///
/// On `Stop` no further ranges are requested; the loop keeps handling completions until every
/// range already requested has committed, then returns and lets the stages run dry.
async fn run_commands(
    shared: Arc<AgentShared>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    requests: mpsc::Sender<LoadRequest>,
) {
    let batch_size = shared.settings.batch_size;
    let hopper = shared.settings.maximum_hopper_size;
    let mut counters = Counters::default();
    let mut stopping = false;
    loop {
        if stopping && counters.in_flight() == 0 {
            break;
        }
        let command = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let handled = match command {
            Command::Stop => {
                debug!(shard = %shared.shard, in_flight = counters.in_flight(), "draining before stop");
                stopping = true;
                Ok(())
            }
            Command::Started {
                high_water,
                last_committed,
            } => started(&shared, &mut counters, high_water, last_committed).await,
            Command::RangeCompleted(ceiling) => counters
                .apply(command)
                .map(|_| shared.tracker.publish(ShardState::new(shared.shard.identity(), ceiling)))
                .map_err(|source| shared.out_of_order(source)),
            Command::HighWaterUpdated(_) => counters
                .apply(command)
                .map(drop)
                .map_err(|source| shared.out_of_order(source)),
        };
        if let Err(err) = handled {
            shared.fail(err);
            break;
        }

        if shared.mode != ExecutionMode::Continuous && counters.is_caught_up() {
            debug!(shard = %shared.shard, sequence = counters.last_committed, "shard caught up");
            *shared.status.lock() = AgentStatus::Stopped;
            shared.complete(Ok(counters.last_committed));
            break;
        }

        if stopping {
            continue;
        }
        while let Some((floor, ceiling)) = counters.next_range(batch_size, hopper) {
            if requests.send((floor, ceiling)).await.is_err() {
                return;
            }
            counters.last_enqueued = ceiling;
        }
    }
}

/// Seeds the counters and, for a rebuild from zero, hands the whole replay to the
/// projection's replay executor when it has one.
async fn started(
    shared: &AgentShared,
    counters: &mut Counters,
    high_water: Sequence,
    last_committed: Sequence,
) -> Result<()> {
    counters
        .apply(Command::Started {
            high_water,
            last_committed,
        })
        .map_err(|source| shared.out_of_order(source))?;
    if shared.mode != ExecutionMode::Rebuild || last_committed != 0 || high_water == 0 {
        return Ok(());
    }
    let Some(executor) = shared.projection.replay_executor() else {
        return Ok(());
    };
    executor
        .replay(shared.projection.clone(), &shared.shard, &shared.storage, high_water, &shared.cancel)
        .await?;
    counters.last_enqueued = high_water;
    counters
        .apply(Command::RangeCompleted(high_water))
        .map_err(|source| shared.out_of_order(source))?;
    shared.committed(high_water);
    shared.tracker.publish(ShardState::new(shared.shard.identity(), high_water));
    Ok(())
}
