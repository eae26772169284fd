//! Domain layer: envelopes, connections, invocations, errors and config.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod invocation;

pub use config::*;
pub use connection::*;
pub use envelope::*;
pub use error::*;
pub use invocation::*;
