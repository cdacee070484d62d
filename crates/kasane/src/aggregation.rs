//! Folding slices into snapshot actions.

pub mod action;
pub mod error;
pub mod runner;
pub mod side_effects;

pub use action::*;
pub use error::*;
pub use runner::*;
pub use side_effects::*;
