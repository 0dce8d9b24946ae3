//! Private certificate authority and device provisioning for energy meters.

// The CA, the provisioning gate and the mutual-TLS bootstrap share one error type, `PkiError`.
// Operational messages go through `log`; security decisions are also recorded by `audit`.

#![forbid(unsafe_code)]

mod error;

/// Structured audit trail
///
/// JSON records of every issuance and rejection, written through `tracing`
/// under the `meterpki::audit` target.
pub mod audit;

/// Mutual-TLS client and server configuration
pub mod channel;

/// TOML configuration and the backend TLS environment
pub mod config;

/// Root CA, certificate requests, device registry and provisioning
///
/// Covers the operator bootstrap, the signing policy per identity class,
/// the registry-gated provisioning service and the device-side client.
pub mod provisioning;

/// Secure file operations with restrictive permissions
///
/// Private keys are written with mode 0600 through a temporary file and an
/// atomic rename.
pub mod secure_file;

/// HTTP provisioning endpoint
pub mod server;

/// Persistence of certificate and key pairs
pub mod store;

pub use error::*;

pub mod reexports {
    pub use {log, rustls, thiserror};
}
