//! Multi-instance connection broker: listener mounts, the accept loop,
//! the splice engine, and the client-facing [`Broker`] which owns them.
//!
//! The broker resolves each configured instance into a bound listener,
//! admits client connections against a process-wide counter, dials an
//! authenticated stream to the remote instance through a [`Dialer`], and
//! splices bytes between the two until either side hangs up.

pub mod accept;
pub mod config;
pub mod counter;
pub mod dial;
pub mod errors;
pub mod fuse;
pub mod instance;
pub mod mount;
pub mod ports;
pub mod splice;

mod client;

pub use accept::RefuseNotify;
pub use client::Broker;
pub use config::{GlobalConfig, InstanceConfig, ListenTarget};
pub use counter::ConnCount;
pub use dial::{BoxedStream, DialError, DialOpts, Dialer};
pub use errors::{Error, MultiError};
pub use instance::InstanceName;
pub use mount::{ListenAddr, Mount};
