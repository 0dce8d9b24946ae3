/// Certificate Signing Requests (PKCS#10)
///
/// The CA side parses and checks requests arriving from devices; the device
/// side generates its key pair and request locally so the private key never
/// leaves the device.
///
/// # Format
///
/// ```text
/// CertificationRequest ::= SEQUENCE {
///   certificationRequestInfo CertificationRequestInfo,
///   signatureAlgorithm AlgorithmIdentifier,
///   signature BIT STRING
/// }
/// ```
///
/// A request is ephemeral: it is parsed, checked, signed and dropped. Nothing
/// here touches storage.
use crate::error::PkiError;
use crate::provisioning::{ca::common_name, KeyAlgorithm, DEFAULT_ORGANIZATION};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use ring::signature::{
    UnparsedPublicKey, VerificationAlgorithm, RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_1024_8192_SHA512_FOR_LEGACY_USE_ONLY,
};
use std::fmt;
use x509_parser::error::X509Error;
use x509_parser::oid_registry::{Oid, OID_PKCS1_SHA256WITHRSA, OID_PKCS1_SHA512WITHRSA};
use x509_parser::prelude::{FromDer, X509CertificationRequest};
use x509_parser::public_key::PublicKey;

/// Minimum accepted RSA modulus size
pub const MIN_RSA_BITS: usize = 2048;

const OID_SECP256R1: &str = "1.2.840.10045.3.1.7";
const OID_SECP384R1: &str = "1.3.132.0.34";

/// A structurally valid PKCS#10 request.
///
/// Construction only checks the ASN.1 structure. The self-signature and the
/// public key are checked by [`verify_signature`](Self::verify_signature) and
/// [`check_public_key`](Self::check_public_key), which the CA runs in that
/// order before signing.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    der: Vec<u8>,
    claimed_subject_name: Option<String>,
}

impl CertificateRequest {
    /// Parse a PEM `CERTIFICATE REQUEST` block.
    pub fn from_pem(pem_str: &str) -> Result<Self, PkiError> {
        let block = pem::parse(pem_str.trim())
            .map_err(|e| PkiError::MalformedRequest(format!("invalid PEM: {}", e)))?;
        match block.tag() {
            "CERTIFICATE REQUEST" | "NEW CERTIFICATE REQUEST" => {}
            other => {
                return Err(PkiError::MalformedRequest(format!(
                    "expected CERTIFICATE REQUEST, found {}",
                    other
                )))
            }
        }
        Self::from_der(block.into_contents())
    }

    /// Parse a DER-encoded request.
    pub fn from_der(der: Vec<u8>) -> Result<Self, PkiError> {
        let claimed_subject_name = {
            let (rest, csr) = X509CertificationRequest::from_der(&der)
                .map_err(|e| PkiError::MalformedRequest(e.to_string()))?;
            if !rest.is_empty() {
                return Err(PkiError::MalformedRequest(format!(
                    "{} trailing bytes after request",
                    rest.len()
                )));
            }
            common_name(&csr.certification_request_info.subject)
        };
        Ok(Self {
            der,
            claimed_subject_name,
        })
    }

    fn parsed(&self) -> Result<X509CertificationRequest<'_>, PkiError> {
        X509CertificationRequest::from_der(&self.der)
            .map(|(_, csr)| csr)
            .map_err(|e| PkiError::MalformedRequest(e.to_string()))
    }

    /// Subject common name the device put in the request. Informational only.
    pub fn claimed_subject_name(&self) -> Option<&str> {
        self.claimed_subject_name.as_deref()
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        crate::provisioning::to_pem("CERTIFICATE REQUEST", &self.der)
    }

    /// Check the subject public key: RSA of at least 2048 bits, or EC on
    /// P-256 or P-384.
    ///
    /// Returns a short description such as `"EC P-256"`.
    pub fn check_public_key(&self) -> Result<String, PkiError> {
        let csr = self.parsed()?;
        let spki = &csr.certification_request_info.subject_pki;
        let key = spki
            .parsed()
            .map_err(|e| PkiError::MalformedPublicKey(e.to_string()))?;

        match key {
            PublicKey::RSA(ref rsa) => {
                let bits = rsa.key_size();
                if bits < MIN_RSA_BITS {
                    return Err(PkiError::MalformedPublicKey(format!(
                        "RSA key of {} bits is below {}",
                        bits, MIN_RSA_BITS
                    )));
                }
                Ok(format!("RSA {}", bits))
            }
            PublicKey::EC(_) => {
                let curve = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .and_then(|params| params.as_oid().ok())
                    .map(|oid| oid.to_id_string())
                    .ok_or_else(|| {
                        PkiError::MalformedPublicKey("EC key without named curve".to_string())
                    })?;
                match curve.as_str() {
                    OID_SECP256R1 => Ok("EC P-256".to_string()),
                    OID_SECP384R1 => Ok("EC P-384".to_string()),
                    other => Err(PkiError::MalformedPublicKey(format!(
                        "unsupported EC curve {}",
                        other
                    ))),
                }
            }
            _ => Err(PkiError::MalformedPublicKey(
                "unsupported public key type".to_string(),
            )),
        }
    }

    /// Verify the self-signature against the enclosed public key.
    ///
    /// Any key that can be checked at all gets a verdict here, including RSA
    /// keys too short for [`check_public_key`](Self::check_public_key), so a
    /// corrupted request is always [`PkiError::InvalidRequestSignature`].
    /// Only a signature algorithm with no verifier is
    /// [`PkiError::MalformedPublicKey`].
    pub fn verify_signature(&self) -> Result<(), PkiError> {
        let csr = self.parsed()?;
        let outcome = match rsa_verification_algorithm(&csr.signature_algorithm.algorithm) {
            Some(algorithm) => {
                let info = &csr.certification_request_info;
                UnparsedPublicKey::new(algorithm, &info.subject_pki.subject_public_key.data)
                    .verify(info.raw, &csr.signature_value.data)
                    .map_err(|_| X509Error::SignatureVerificationError)
            }
            None => csr.verify_signature(),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(X509Error::SignatureUnsupportedAlgorithm) => Err(PkiError::MalformedPublicKey(
                "no verifier for the request signature algorithm".to_string(),
            )),
            Err(_) => Err(PkiError::InvalidRequestSignature),
        }
    }
}

/// PKCS#1 v1.5 verifiers that accept moduli from 1024 bits; the size policy
/// is applied afterwards by `check_public_key`.
fn rsa_verification_algorithm(oid: &Oid) -> Option<&'static dyn VerificationAlgorithm> {
    if *oid == OID_PKCS1_SHA256WITHRSA {
        Some(&RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY)
    } else if *oid == OID_PKCS1_SHA512WITHRSA {
        Some(&RSA_PKCS1_1024_8192_SHA512_FOR_LEGACY_USE_ONLY)
    } else {
        None
    }
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("claimed_subject_name", &self.claimed_subject_name)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// A locally generated key pair and the request for it
#[derive(Clone)]
pub struct GeneratedRequest {
    /// PEM request to send to the CA
    pub csr_pem: String,
    /// PKCS#8 PEM private key; stays on the device
    pub private_key_pem: String,
}

impl fmt::Debug for GeneratedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedRequest")
            .field("csr_pem", &self.csr_pem)
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Generate a key pair and a request whose subject is
/// `CN=<subject_name>, O=EnergyMeter IoT`.
pub fn generate_request(
    subject_name: &str,
    algorithm: KeyAlgorithm,
) -> Result<GeneratedRequest, PkiError> {
    let key_pair = algorithm.generate()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, DEFAULT_ORGANIZATION);
    dn.push(DnType::CommonName, subject_name);
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| PkiError::SigningError(format!("cannot build request: {}", e)))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| PkiError::SigningError(format!("cannot encode request: {}", e)))?;

    Ok(GeneratedRequest {
        csr_pem,
        private_key_pem: key_pair.serialize_pem(),
    })
}
