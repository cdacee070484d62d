//! Event-type keyed dispatch of create, apply and delete handlers for an aggregate.

pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod handler;

pub use descriptor::*;
pub use dispatcher::*;
pub use error::*;
pub use handler::*;
