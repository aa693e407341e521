//! Per-machine collector: a long-lived task polling a managed node and
//! coalescing results into an [`Info`] snapshot.

mod info;
mod poll;
mod task;

pub use info::Info;
pub use poll::{PollError, Poller};
pub use task::{CollectorConfig, CollectorHandle};
