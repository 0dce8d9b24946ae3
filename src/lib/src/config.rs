//! Configuration: the operator's TOML file and the backend's TLS
//! environment.
//!
//! ```toml
//! [ca]
//! common_name = "EnergyMeter Root CA"
//! key_algorithm = "ecdsa-p256"
//!
//! [identities]
//! server_alt_names = ["localhost", "127.0.0.1", "broker.internal"]
//!
//! [store]
//! directory = "certs"
//!
//! [server]
//! listen = "0.0.0.0:3000"
//! registry = "devices.json"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::channel::{self, Credentials, MtlsClient, TrustAnchor};
use crate::error::PkiError;
use crate::provisioning::{CaConfig, KeyAlgorithm, DEVICE_VALIDITY_DAYS, SERVICE_VALIDITY_DAYS};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable holding the base64 root certificate
pub const CA_CERT_VAR: &str = "CA_CERT_B64";
/// Environment variable holding the base64 backend certificate
pub const BACKEND_CERT_VAR: &str = "BACKEND_CERT_B64";
/// Environment variable holding the base64 backend private key
pub const BACKEND_KEY_VAR: &str = "BACKEND_KEY_B64";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PkiConfig {
    pub ca: CaSection,
    pub identities: IdentitiesSection,
    pub store: StoreSection,
    pub server: ServerSection,
}

/// `[ca]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaSection {
    pub common_name: String,
    pub organization: String,
    pub country: Option<String>,
    pub state: Option<String>,
    pub validity_days: u32,
    pub key_algorithm: KeyAlgorithm,
}

impl Default for CaSection {
    fn default() -> Self {
        let defaults = CaConfig::default();
        Self {
            common_name: defaults.common_name,
            organization: defaults.organization,
            country: defaults.country,
            state: defaults.state,
            validity_days: defaults.validity_days,
            key_algorithm: defaults.key_algorithm,
        }
    }
}

/// `[identities]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentitiesSection {
    pub server_common_name: String,
    pub server_alt_names: Vec<String>,
    pub backend_common_name: String,
    pub service_validity_days: u32,
    pub device_validity_days: u32,
}

impl Default for IdentitiesSection {
    fn default() -> Self {
        Self {
            server_common_name: "localhost".to_string(),
            server_alt_names: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            backend_common_name: "backend-system".to_string(),
            service_validity_days: SERVICE_VALIDITY_DAYS,
            device_validity_days: DEVICE_VALIDITY_DAYS,
        }
    }
}

/// `[store]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub directory: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("certs"),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub listen: String,
    pub registry: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            registry: PathBuf::from("devices.json"),
        }
    }
}

impl PkiConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PkiError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PkiError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, PkiError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PkiError> {
        if self.ca.common_name.is_empty() {
            return Err(PkiError::ConfigError("ca.common_name is empty".to_string()));
        }
        if self.ca.organization.is_empty() {
            return Err(PkiError::ConfigError("ca.organization is empty".to_string()));
        }
        for (field, days) in [
            ("ca.validity_days", self.ca.validity_days),
            ("identities.service_validity_days", self.identities.service_validity_days),
            ("identities.device_validity_days", self.identities.device_validity_days),
        ] {
            if days == 0 {
                return Err(PkiError::ConfigError(format!("{} must be positive", field)));
            }
        }
        Ok(())
    }

    /// Root settings in the form the authority takes them
    pub fn ca_config(&self) -> CaConfig {
        CaConfig {
            common_name: self.ca.common_name.clone(),
            organization: self.ca.organization.clone(),
            country: self.ca.country.clone(),
            state: self.ca.state.clone(),
            validity_days: self.ca.validity_days,
            key_algorithm: self.ca.key_algorithm,
        }
    }
}

/// The backend's trust material, passed as base64 PEM in three
/// environment variables.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendTlsEnv {
    pub ca_certificate_pem: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for BackendTlsEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTlsEnv")
            .field("ca_certificate_pem", &self.ca_certificate_pem)
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}

impl BackendTlsEnv {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, PkiError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`. A missing or undecodable variable is fatal.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PkiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| -> Result<String, PkiError> {
            let value = lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PkiError::ConfigError(format!("{} is not set", name)))?;
            let bytes = STANDARD
                .decode(value.trim())
                .map_err(|e| PkiError::ConfigError(format!("{} is not valid base64: {}", name, e)))?;
            String::from_utf8(bytes)
                .map_err(|_| PkiError::ConfigError(format!("{} does not decode to PEM text", name)))
        };

        Ok(Self {
            ca_certificate_pem: read(CA_CERT_VAR)?,
            certificate_pem: read(BACKEND_CERT_VAR)?,
            private_key_pem: read(BACKEND_KEY_VAR)?,
        })
    }

    /// `(name, base64 value)` pairs, ready to print as `NAME=value`
    pub fn exports(&self) -> Vec<(&'static str, String)> {
        vec![
            (CA_CERT_VAR, STANDARD.encode(&self.ca_certificate_pem)),
            (BACKEND_CERT_VAR, STANDARD.encode(&self.certificate_pem)),
            (BACKEND_KEY_VAR, STANDARD.encode(&self.private_key_pem)),
        ]
    }

    pub fn trust_anchor(&self) -> Result<TrustAnchor, PkiError> {
        TrustAnchor::from_pem(&self.ca_certificate_pem)
    }

    pub fn credentials(&self) -> Result<Credentials, PkiError> {
        Credentials::from_pem(&self.certificate_pem, &self.private_key_pem)
    }

    /// Backend client configuration with a fresh `backend-service-*` id.
    pub fn client_config(&self) -> Result<MtlsClient, PkiError> {
        channel::build_client_config(
            &self.trust_anchor()?,
            &self.credentials()?,
            channel::backend_client_id()?,
        )
    }
}
