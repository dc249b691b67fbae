#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Core of the Sinoman member app: signed and certificate pinned backend access, connectivity
//! tracking, and the offline QR payment queue that replays once the device reconnects.

mod client;
pub use client::*;

mod config;
pub use config::*;

mod error;
pub use error::*;

mod fetch;
pub use fetch::*;

mod money;
pub use money::*;

mod network;
pub use network::*;

mod payment;
pub use payment::*;

mod pinning;
pub use pinning::*;

mod queue;
pub use queue::*;

mod session;
pub use session::{Session, SessionUser};

mod signing;
pub use signing::*;

mod storage;
pub use storage::*;

mod transport;
pub use transport::*;

/// Bridge from the `log` facade to a host supplied logger.
pub mod logger;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!("sinoman_core");
