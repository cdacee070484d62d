//! The asynchronous projection daemon: one agent per shard, fed by the high-water agent.

pub mod agent;
pub mod command;
pub mod error;
pub mod high_water;
pub mod host;
mod pipeline;
pub mod range;
pub mod replay;
pub mod shard;

pub use agent::ShardAgent;
pub use command::*;
pub use error::*;
pub use high_water::*;
pub use host::*;
pub use range::*;
pub use replay::*;
pub use shard::*;
