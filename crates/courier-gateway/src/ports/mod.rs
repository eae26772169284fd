//! Ports: what the gateway needs from its environment.

pub mod hooks;
pub mod outbound;

pub use hooks::{CloseReason, ConnectionHooks, DefaultHooks, VerifiedIdentity};
pub use outbound::{
    Credential, CredentialRegistry, ManualClock, StaticCredentialRegistry, SystemTimeSource,
    TimeSource,
};
