//! Pooled multi-executor Tcp server framework.
//!
//! Three executor pools split the work of a connection: acceptors pull
//! sockets off the listeners, io executors run each connection's driver
//! task, and an elastic work pool runs the user's [`Work`] callbacks.
//! Connections live in preallocated [`ServiceHandler`]s recycled through a
//! fixed pool, and two handlers can be paired parent/child to relay bytes
//! between connections (see [`Connector`]).

#![forbid(unsafe_code)]

mod builder;
mod client;
mod error;
mod event;
mod executor;
mod handler;
mod net;
mod server;
mod work;

pub use builder::Builder;
pub use client::Connector;
pub use error::CloseReason;
pub use event::{Event, EventKind};
pub use handler::{PeerRef, ServiceHandler, Status};
pub use net::Transport;
pub use server::{Server, ServerHandle};
pub use work::{Work, WorkAllocator};
