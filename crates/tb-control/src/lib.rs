//! Testbed control protocol engine.
//!
//! Serves the line-oriented command protocol a test driver uses to manage an
//! isolated testbed (container, VM, chroot, remote host) and forwards the
//! technology-specific work to a [`TestbedBackend`] implementation.

pub mod backend;
pub mod config;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod process;
pub mod protocol;
pub mod session;
pub mod signals;
pub mod socket;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use backend::*;
pub use config::*;
pub use deadline::*;
pub use dispatch::*;
pub use error::*;
pub use process::*;
pub use protocol::*;
pub use session::*;
pub use socket::*;
pub use transfer::*;
