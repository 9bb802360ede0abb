//! Kernel map handles received from the agent
//!
//! A [`MapHandle`] owns one map descriptor together with the metadata the
//! kernel reports for it. [`MapView`] is the key/value access the metrics
//! path needs, implemented for kernel maps and for [`MemoryMap`].

mod handle;
pub(crate) mod sys;
mod view;

pub use handle::{MapHandle, MapInfo, MapKind, MetricsHandles};
pub use view::{MapEntry, MapView, MemoryMap};
