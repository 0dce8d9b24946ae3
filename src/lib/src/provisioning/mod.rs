/// Device identity and certificate issuance
///
/// A private Certificate Authority issues X.509 client identities to energy
/// meters, plus the server and backend identities the message broker and the
/// backend use for mutual TLS.
///
/// # Architecture
///
/// ```text
/// Operator (once):
/// ┌─────────────────────────────────────────────────────────────┐
/// │ 1. Generate root key + self-signed root (ca.crt / ca.key)   │
/// │ 2. Issue server identity (serverAuth, localhost/127.0.0.1)  │
/// │ 3. Issue backend identity (clientAuth, backend-system)      │
/// └─────────────────────────────────────────────────────────────┘
///                            ↓
/// Device (first boot):
/// ┌─────────────────────────────────────────────────────────────┐
/// │ 1. Generate key pair locally                                │
/// │ 2. Build CSR with the serial number as subject              │
/// │ 3. POST {serialNumber, csr} to /devices/provision           │
/// │ 4. CA checks the registry, verifies the CSR, signs it       │
/// │ 5. Persist <serial>.key, <serial>.crt, ca.crt               │
/// │ 6. Connect to the broker with mutual TLS                    │
/// └─────────────────────────────────────────────────────────────┘
/// ```
///
/// # Identity Classes
///
/// - **Root**: self-signed, 10 years, `keyCertSign`/`cRLSign`
/// - **Server**: broker-facing, `serverAuth`, SANs for the broker host
/// - **BackendService**: backend client, `clientAuth`
/// - **Device**: one per meter, 1 year, `clientAuth`, CN = serial number
///
/// The role, not the common name, selects the extension policy.
use crate::error::PkiError;
use crate::store::KeyMaterial;
use rcgen::{ExtendedKeyUsagePurpose, KeyUsagePurpose};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub mod bootstrap;
pub mod ca;
pub mod client;
pub mod csr;
pub mod device;
pub mod session;
pub mod verification;

pub use bootstrap::{bootstrap, BootstrapReport};
pub use ca::{CaConfig, CertificateAuthority, SignedCertificate};
pub use client::{
    DeviceCredentials, DeviceProvisioner, HttpTransport, LocalTransport, ProvisioningTransport,
    RetryPolicy,
};
pub use csr::{generate_request, CertificateRequest, GeneratedRequest};
pub use device::{DeviceRecord, DeviceRegistry, JsonDeviceRegistry, MemoryDeviceRegistry};
pub use session::{ProvisioningService, ProvisioningStats};
pub use verification::{inspect_certificate, CertificateInfo, IdentityVerifier, VerifiedIdentity};

/// Store name of the root identity
pub const ROOT_NAME: &str = "ca";
/// Store name of the broker-facing server identity
pub const SERVER_NAME: &str = "server";
/// Store name of the backend service-client identity
pub const BACKEND_NAME: &str = "backend";

/// Validity of device certificates
pub const DEVICE_VALIDITY_DAYS: u32 = 365;
/// Validity of root and service identities
pub const SERVICE_VALIDITY_DAYS: u32 = 3650;
/// Organization placed in every subject
pub const DEFAULT_ORGANIZATION: &str = "EnergyMeter IoT";

/// Identity class of a certificate holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Root,
    Server,
    BackendService,
    Device,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Server => "server",
            Role::BackendService => "backend",
            Role::Device => "device",
        }
    }

    /// Key usages carried by certificates of this role
    pub fn key_usages(&self) -> Vec<KeyUsagePurpose> {
        match self {
            Role::Root => vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign],
            Role::Server | Role::BackendService | Role::Device => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
        }
    }

    /// Extended key usages carried by certificates of this role
    pub fn extended_key_usages(&self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Role::Root => vec![],
            Role::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Role::BackendService | Role::Device => vec![ExtendedKeyUsagePurpose::ClientAuth],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(Role::Root),
            "server" => Ok(Role::Server),
            "backend" | "backend_service" => Ok(Role::BackendService),
            "device" => Ok(Role::Device),
            other => Err(PkiError::InvalidArgument(format!("unknown role '{}'", other))),
        }
    }
}

/// Signature key algorithm for generated key pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// ECDSA P-256 with SHA-256
    #[default]
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
    /// ECDSA P-384 with SHA-384
    #[serde(rename = "ecdsa-p384")]
    EcdsaP384,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
            KeyAlgorithm::EcdsaP384 => "ecdsa-p384",
        }
    }

    pub(crate) fn generate(&self) -> Result<rcgen::KeyPair, PkiError> {
        let alg = match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        };
        rcgen::KeyPair::generate_for(alg)
            .map_err(|e| PkiError::SigningError(format!("key generation failed: {}", e)))
    }
}

impl FromStr for KeyAlgorithm {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ecdsa-p256" => Ok(KeyAlgorithm::EcdsaP256),
            "ecdsa-p384" => Ok(KeyAlgorithm::EcdsaP384),
            other => Err(PkiError::InvalidArgument(format!(
                "unsupported key algorithm '{}'",
                other
            ))),
        }
    }
}

/// A signed certificate, without any private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM encoding
    pub pem: String,
    /// DER encoding
    pub der: Vec<u8>,
    /// Certificate serial number (big-endian, positive)
    pub serial_number: Vec<u8>,
    /// Subject common name
    pub subject_name: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl IssuedCertificate {
    /// Serial number as lowercase hex
    pub fn serial_hex(&self) -> String {
        hex::encode(&self.serial_number)
    }

    /// SHA-256 fingerprint of the DER encoding, as `sha256:<hex>`
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.der)
    }

    /// `notBefore <= now <= notAfter`
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// One cryptographic actor: a certificate and the private key it certifies
#[derive(Clone)]
pub struct Identity {
    pub role: Role,
    pub certificate: IssuedCertificate,
    pub private_key_pem: String,
}

impl Identity {
    pub fn subject_name(&self) -> &str {
        &self.certificate.subject_name
    }

    /// Certificate and key as a storable pair
    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial::new(self.certificate.pem.clone(), self.private_key_pem.clone())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("role", &self.role)
            .field("subject_name", &self.certificate.subject_name)
            .field("serial_number", &self.certificate.serial_hex())
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Body of `POST /devices/provision`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    pub serial_number: String,
    /// PEM-encoded PKCS#10 request
    pub csr: String,
}

/// Successful provisioning answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResponse {
    /// Issued device certificate (PEM)
    pub certificate: String,
    /// Root certificate (PEM)
    pub ca_certificate: String,
}

/// Failure answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// SHA-256 fingerprint of DER bytes, as `sha256:<hex>`
pub fn fingerprint(der: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(der)))
}

/// Random positive 128-bit certificate serial from the OS RNG.
pub(crate) fn random_serial() -> Result<Vec<u8>, PkiError> {
    let mut serial = [0u8; 16];
    getrandom::fill(&mut serial)
        .map_err(|e| PkiError::SigningError(format!("OS RNG unavailable: {}", e)))?;
    // Positive, and no leading zero octet so the DER encoding keeps all 16 bytes
    serial[0] &= 0x7f;
    if serial[0] == 0 {
        serial[0] = 0x01;
    }
    Ok(serial.to_vec())
}

/// Encode DER as a PEM block with the given tag.
pub(crate) fn to_pem(tag: &str, der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(tag, der.to_vec()))
}

/// Decode the first `CERTIFICATE` block of a PEM string.
pub(crate) fn certificate_der_from_pem(pem_str: &str) -> Result<Vec<u8>, PkiError> {
    let blocks = pem::parse_many(pem_str)?;
    blocks
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .ok_or_else(|| PkiError::CertificateError("no CERTIFICATE block found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_policy() {
        assert_eq!(
            Role::Server.extended_key_usages(),
            vec![ExtendedKeyUsagePurpose::ServerAuth]
        );
        assert_eq!(
            Role::Device.extended_key_usages(),
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        );
        assert_eq!(
            Role::BackendService.extended_key_usages(),
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        );
        assert!(Role::Root.extended_key_usages().is_empty());
        assert!(Role::Root.key_usages().contains(&KeyUsagePurpose::KeyCertSign));
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("backend".parse::<Role>().unwrap(), Role::BackendService);
        assert_eq!("server".parse::<Role>().unwrap(), Role::Server);
        assert!("backend-system".parse::<Role>().is_err());
    }

    #[test]
    fn test_random_serial_is_positive_and_distinct() {
        let a = random_serial().unwrap();
        let b = random_serial().unwrap();
        assert_eq!(a.len(), 16);
        assert!(a[0] & 0x80 == 0 && a[0] != 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let response = ProvisioningResponse {
            certificate: "cert".to_string(),
            ca_certificate: "ca".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["caCertificate"], "ca");

        let request: ProvisioningRequest =
            serde_json::from_str(r#"{"serialNumber":"central_simulada_01","csr":"x"}"#).unwrap();
        assert_eq!(request.serial_number, "central_simulada_01");
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"");
        assert_eq!(
            fp,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_certificate_der_from_pem_requires_certificate_block() {
        let pem = to_pem("CERTIFICATE", &[1, 2, 3]);
        assert_eq!(certificate_der_from_pem(&pem).unwrap(), vec![1, 2, 3]);

        let key = to_pem("PRIVATE KEY", &[1, 2, 3]);
        assert!(certificate_der_from_pem(&key).is_err());
    }
}
