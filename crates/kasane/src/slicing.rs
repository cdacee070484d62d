pub mod enrichment;
pub mod error;
pub mod fan_out;
pub mod group;
pub mod identity;
pub mod multi_stream;
pub mod single_stream;
pub mod slice;

pub use enrichment::*;
pub use error::*;
pub use fan_out::*;
pub use group::*;
pub use identity::*;
pub use multi_stream::*;
pub use single_stream::*;
pub use slice::*;
