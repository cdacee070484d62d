use crate::event::Sequence;

/// Messages handled, strictly in order, by a shard agent's command task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    HighWaterUpdated(Sequence),
    Started {
        high_water: Sequence,
        last_committed: Sequence,
    },
    RangeCompleted(Sequence),
    Stop,
}

/// A command that would break `last_committed <= last_enqueued <= high_water_mark`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{command:?} is out of order for {counters:?}")]
pub struct CommandOutOfOrder {
    pub command: Command,
    pub counters: Counters,
}

/// Positions owned by the command task; nothing else writes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub last_enqueued: Sequence,
    pub last_committed: Sequence,
    pub high_water_mark: Sequence,
}

impl Counters {
    /// Applies one command. Returns false when it changed nothing.
    ///
    /// A stale high-water mark is ignored. A range completing at or below the last commit, or
    /// beyond what was enqueued, is an ordering failure and leaves the counters untouched.
    pub fn apply(&mut self, command: Command) -> Result<bool, CommandOutOfOrder> {
        match command {
            Command::HighWaterUpdated(mark) => {
                if mark <= self.high_water_mark {
                    return Ok(false);
                }
                self.high_water_mark = mark;
            }
            Command::Started {
                high_water,
                last_committed,
            } => {
                // Progress may already be past a mark detected a moment earlier.
                self.high_water_mark = high_water.max(last_committed);
                self.last_committed = last_committed;
                self.last_enqueued = last_committed;
            }
            Command::RangeCompleted(ceiling) => {
                if ceiling <= self.last_committed || ceiling > self.last_enqueued {
                    return Err(CommandOutOfOrder {
                        command,
                        counters: *self,
                    });
                }
                self.last_committed = ceiling;
            }
            Command::Stop => return Ok(false),
        }
        Ok(true)
    }

    pub fn in_flight(&self) -> Sequence {
        self.last_enqueued.saturating_sub(self.last_committed)
    }

    pub fn is_caught_up(&self) -> bool {
        self.last_committed >= self.high_water_mark
    }

    /// The next `(floor, ceiling]` window to load, if any.
    ///
    /// Nothing is requested once `maximum_hopper_size` sequences are in flight. A backlog bigger
    /// than one batch is paged eagerly; a smaller one is only requested while less than two
    /// batches are in flight, so trickles of events get batched up.
    pub fn next_range(&self, batch_size: Sequence, maximum_hopper_size: Sequence) -> Option<(Sequence, Sequence)> {
        if self.in_flight() >= maximum_hopper_size {
            return None;
        }
        if self.high_water_mark <= self.last_enqueued {
            return None;
        }
        let floor = self.last_enqueued;
        let backlog = self.high_water_mark - floor;
        if backlog > batch_size {
            Some((floor, floor + batch_size))
        } else if self.in_flight() < batch_size.saturating_mul(2) {
            Some((floor, self.high_water_mark))
        } else {
            None
        }
    }
}
