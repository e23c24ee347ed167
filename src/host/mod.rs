//! Host side of the pipeline: the publisher streams emulator snapshots to
//! the relay (buffering while offline), and the dedicated host runs an
//! unattached command under a PTY on top of it.

mod command;
mod publisher;

pub use command::CommandHost;
pub use publisher::{PublishOptions, Publisher, PublisherCallbacks};
