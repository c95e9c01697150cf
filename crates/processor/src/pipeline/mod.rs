//! Pipeline wiring
//!
//! - [`raw`]: decode, write raw trades, commit
//! - [`windowed`]: decode, watermark, aggregate, flush closed windows, commit
//! - [`driver`]: one shard per partition running both paths over each batch
//! - [`builder`]: assembles a driver from its collaborators

pub mod builder;
pub mod driver;
pub mod raw;
pub mod windowed;

pub use builder::PipelineBuilder;
pub use driver::{PipelineDriver, PipelineHandle, PipelineReport};
pub use raw::RawPath;
pub use windowed::WindowedPath;
