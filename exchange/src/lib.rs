//! Descriptor exchange between the eBPF agent and its receivers
//!
//! The agent owns the kernel buffer maps. Receivers running in other
//! processes connect to a well-known Unix socket, send a request naming the
//! signal they consume, and get the map descriptors back as `SCM_RIGHTS`
//! ancillary data. Every connection carries exactly one request and one
//! response.

pub mod client;
pub mod error;
pub mod protocol;
pub mod scm;
pub mod server;

pub use client::{Client, ClientOptions, SocketIdentity};
pub use error::ExchangeError;
pub use protocol::{HandleSignal, RequestType, DEFAULT_SOCKET_PATH};
pub use server::Server;
