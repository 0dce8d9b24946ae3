//! Structured audit trail for certificate issuance.
//!
//! Operational logging goes through the `log` facade; this module writes a
//! separate, machine-readable record of every security decision the CA makes,
//! using `tracing` events under the `meterpki::audit` target.
//!
//! # Usage
//!
//! ```rust,ignore
//! use meterpki::audit::{self, AuditConfig, LogDestination};
//!
//! audit::init(AuditConfig {
//!     destination: LogDestination::File("/var/log/meterpki-audit.json".into()),
//!     ..AuditConfig::default()
//! })?;
//! ```
//!
//! # Event Types
//!
//! - `provisioning.attempt` - a device submitted a certificate request
//! - `provisioning.success` - a device certificate was issued
//! - `provisioning.rejected` - the serial number is not registered
//! - `provisioning.tamper` - the request self-signature did not verify
//! - `provisioning.failure` - any other failure (malformed input, signing)
//! - `identity.issued` - a root or service identity was created
//! - `key.generated` - a key pair was generated
//!
//! # JSON Output Example
//!
//! ```json
//! {
//!   "timestamp": "2026-01-04T20:00:00Z",
//!   "level": "INFO",
//!   "target": "meterpki::audit",
//!   "event_type": "provisioning.success",
//!   "correlation_id": "5f0c...",
//!   "serial_number": "central_simulada_01",
//!   "certificate_serial": "3a9f...",
//!   "certificate_fingerprint": "sha256:e3b0c442..."
//! }
//! ```

use crate::error::PkiError;

use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    prelude::*,
    EnvFilter,
};

/// Global audit configuration state
static AUDIT_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Audit log configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Enable audit logging (default: true)
    pub enabled: bool,
    /// Log destination
    pub destination: LogDestination,
    /// Use JSON format (default: true for production)
    pub json_format: bool,
    /// Shorten device serial numbers in audit records (default: false)
    pub redact_serials: bool,
    /// Log level filter (default: "meterpki::audit=info")
    pub filter: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: LogDestination::Stderr,
            json_format: true,
            redact_serials: false,
            filter: "meterpki::audit=info".to_string(),
        }
    }
}

/// Audit log destination
#[derive(Debug, Clone, Default)]
pub enum LogDestination {
    /// Write to stdout
    Stdout,
    /// Write to stderr (default)
    #[default]
    Stderr,
    /// Write to a file (path)
    File(String),
}

/// Initialize the audit trail. Only the first call has an effect.
///
/// Fails if a file destination cannot be opened.
pub fn init(config: AuditConfig) -> Result<(), PkiError> {
    if AUDIT_INITIALIZED.get().is_some() {
        return Ok(());
    }

    if !config.enabled {
        let _ = AUDIT_INITIALIZED.set(true);
        return Ok(());
    }

    let _ = REDACT_SERIALS.set(config.redact_serials);

    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match &config.destination {
        LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogDestination::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
    };
    let layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_writer(writer);

    let installed = if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    };
    installed.map_err(|e| PkiError::ConfigError(format!("audit subscriber: {}", e)))?;

    let _ = AUDIT_INITIALIZED.set(true);
    Ok(())
}

/// Shorten a device serial for display: keeps the first four characters.
///
/// Transforms "central_simulada_01" into "cent***"
pub fn redact_serial(serial: &str) -> String {
    let visible: String = serial.chars().take(4).collect();
    if serial.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("{}***", visible)
    }
}

static REDACT_SERIALS: OnceLock<bool> = OnceLock::new();

fn display_serial(serial: &str) -> String {
    if *REDACT_SERIALS.get().unwrap_or(&false) {
        redact_serial(serial)
    } else {
        serial.to_string()
    }
}

/// Generate a new correlation ID for tracking related audit events.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Audit Event Functions
// ============================================================================

/// A device submitted a certificate request.
pub fn log_provisioning_attempt(correlation_id: &str, serial_number: &str) {
    tracing::info!(
        target: "meterpki::audit",
        event_type = "provisioning.attempt",
        correlation_id = correlation_id,
        serial_number = %display_serial(serial_number),
        "Provisioning request received"
    );
}

/// A device certificate was issued.
pub fn log_provisioning_success(
    correlation_id: &str,
    serial_number: &str,
    certificate_serial: &str,
    certificate_fingerprint: &str,
) {
    tracing::info!(
        target: "meterpki::audit",
        event_type = "provisioning.success",
        correlation_id = correlation_id,
        serial_number = %display_serial(serial_number),
        certificate_serial = certificate_serial,
        certificate_fingerprint = certificate_fingerprint,
        "Device certificate issued"
    );
}

/// Provisioning refused because the serial is not registered.
pub fn log_provisioning_rejected(correlation_id: &str, serial_number: &str) {
    tracing::warn!(
        target: "meterpki::audit",
        event_type = "provisioning.rejected",
        correlation_id = correlation_id,
        serial_number = %display_serial(serial_number),
        "Provisioning refused for unregistered device"
    );
}

/// The request self-signature failed: possible tampering or corruption.
pub fn log_provisioning_tamper(correlation_id: &str, serial_number: &str) {
    tracing::warn!(
        target: "meterpki::audit",
        event_type = "provisioning.tamper",
        correlation_id = correlation_id,
        serial_number = %display_serial(serial_number),
        "Certificate request signature did not verify"
    );
}

/// Provisioning failed for any other reason.
pub fn log_provisioning_failure(
    correlation_id: &str,
    serial_number: &str,
    error_type: &str,
    error_message: &str,
) {
    let safe_message = sanitize_error_message(error_message);

    tracing::warn!(
        target: "meterpki::audit",
        event_type = "provisioning.failure",
        correlation_id = correlation_id,
        serial_number = %display_serial(serial_number),
        error_type = error_type,
        error_message = %safe_message,
        "Provisioning failed"
    );
}

/// A root or service identity was issued.
pub fn log_identity_issued(
    role: &str,
    subject_name: &str,
    certificate_serial: &str,
    certificate_fingerprint: &str,
) {
    tracing::info!(
        target: "meterpki::audit",
        event_type = "identity.issued",
        role = role,
        subject_name = subject_name,
        certificate_serial = certificate_serial,
        certificate_fingerprint = certificate_fingerprint,
        "Identity issued"
    );
}

/// Log a key generation event.
pub fn log_key_generation(key_type: &str, purpose: &str) {
    tracing::info!(
        target: "meterpki::audit",
        event_type = "key.generated",
        key_type = key_type,
        purpose = purpose,
        "Cryptographic key generated"
    );
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Sanitize error messages to avoid leaking key material or tokens.
fn sanitize_error_message(message: &str) -> String {
    let sanitized = message
        .split_whitespace()
        .map(|word| {
            if word.len() > 40
                && word
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '+' | '/' | '='))
            {
                "[REDACTED]"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if sanitized.chars().count() > 500 {
        let truncated: String = sanitized.chars().take(497).collect();
        format!("{}...", truncated)
    } else {
        sanitized
    }
}
