//! Build event plumbing for observability.
//!
//! Steps report their lifecycle through a [`BuildStepDelegate`] handed to
//! them at construction, and write process output to the sinks it provides.
//! Where those bytes and events end up is the delegate's business.

mod delegate;
mod output;

pub use delegate::{BuildStepDelegate, CollectingDelegate, DelegateEvent, LoggingDelegate, NoOpDelegate};
pub use output::{BufferSink, NullSink, OutputSink, TracingSink};
