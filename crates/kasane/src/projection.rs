pub mod adapter;
pub mod aggregate;

pub use adapter::*;
pub use aggregate::*;
