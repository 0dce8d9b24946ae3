/// Offline certificate verification
///
/// Checks that a certificate chains to the private root, is inside its
/// validity window and carries the expected extended key usage. Used by
/// devices to vet what the provisioning endpoint hands back before storing
/// it, and by operators to inspect issued identities.
///
/// # Security Model
///
/// - The verifier embeds the root certificate as its only trust anchor
/// - Every identity is signed directly by the root
/// - No revocation checking (none exists for this CA)
use crate::error::PkiError;
use crate::provisioning::{ca::common_name, certificate_der_from_pem, fingerprint};
use rustls_pki_types::{CertificateDer, TrustAnchor, UnixTime};
use std::time::Duration;
use time::OffsetDateTime;
use webpki::{EndEntityCert, KeyUsage};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Facts about a certificate that passed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Subject common name
    pub subject_name: String,
    /// Certificate serial number, lowercase hex
    pub serial_hex: String,
    pub not_after: OffsetDateTime,
}

/// Verifies identities against the private root
pub struct IdentityVerifier {
    root_anchor: TrustAnchor<'static>,
}

impl IdentityVerifier {
    /// Create a verifier from a DER root certificate.
    pub fn new(root_cert_der: &[u8]) -> Result<Self, PkiError> {
        let root_cert = CertificateDer::from(root_cert_der);
        let root_anchor = webpki::anchor_from_trusted_cert(&root_cert)
            .map_err(|e| PkiError::CertificateError(format!("Invalid root certificate: {:?}", e)))?
            .to_owned();

        Ok(Self { root_anchor })
    }

    /// Create a verifier from a PEM root certificate.
    pub fn from_pem(root_cert_pem: &str) -> Result<Self, PkiError> {
        Self::new(&certificate_der_from_pem(root_cert_pem)?)
    }

    /// Verify a client identity (backend or device).
    ///
    /// `verification_time` is a Unix timestamp; `None` means now.
    pub fn verify_client(
        &self,
        cert_der: &[u8],
        verification_time: Option<u64>,
    ) -> Result<VerifiedIdentity, PkiError> {
        self.verify(cert_der, KeyUsage::client_auth(), verification_time)
    }

    /// Verify a server identity.
    pub fn verify_server(
        &self,
        cert_der: &[u8],
        verification_time: Option<u64>,
    ) -> Result<VerifiedIdentity, PkiError> {
        self.verify(cert_der, KeyUsage::server_auth(), verification_time)
    }

    /// Verify a device identity and that its subject is `serial_number`.
    pub fn verify_device(
        &self,
        cert_der: &[u8],
        serial_number: &str,
        verification_time: Option<u64>,
    ) -> Result<VerifiedIdentity, PkiError> {
        let identity = self.verify_client(cert_der, verification_time)?;
        if identity.subject_name != serial_number {
            return Err(PkiError::CertificateError(format!(
                "certificate subject '{}' does not match serial '{}'",
                identity.subject_name, serial_number
            )));
        }
        Ok(identity)
    }

    fn verify(
        &self,
        cert_der: &[u8],
        usage: KeyUsage,
        verification_time: Option<u64>,
    ) -> Result<VerifiedIdentity, PkiError> {
        let cert_der = CertificateDer::from(cert_der);
        let cert = EndEntityCert::try_from(&cert_der)
            .map_err(|e| PkiError::CertificateError(format!("Invalid certificate: {:?}", e)))?;

        let time = match verification_time {
            Some(ts) => UnixTime::since_unix_epoch(Duration::from_secs(ts)),
            None => UnixTime::now(),
        };

        cert.verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &[self.root_anchor.clone()],
            &[],
            time,
            usage,
            None, // No revocation data
            None,
        )
        .map_err(|e| {
            PkiError::CertificateError(format!("Certificate chain verification failed: {:?}", e))
        })?;

        let (_, parsed) = X509Certificate::from_der(&cert_der)?;
        Ok(VerifiedIdentity {
            subject_name: common_name(parsed.subject()).unwrap_or_default(),
            serial_hex: hex::encode(parsed.raw_serial()),
            not_after: parsed.validity().not_after.to_datetime(),
        })
    }
}

/// Human-oriented summary of a certificate, for operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_hex: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub fingerprint: String,
    pub is_ca: bool,
    /// `serverAuth` / `clientAuth`
    pub extended_key_usages: Vec<&'static str>,
}

/// Summarize the first certificate of a PEM string. Performs no trust checks.
pub fn inspect_certificate(pem_str: &str) -> Result<CertificateInfo, PkiError> {
    let der = certificate_der_from_pem(pem_str)?;
    let (_, cert) = X509Certificate::from_der(&der)?;

    let is_ca = cert
        .basic_constraints()
        .map_err(|e| PkiError::CertificateError(e.to_string()))?
        .map(|ext| ext.value.ca)
        .unwrap_or(false);
    let mut extended_key_usages = Vec::new();
    if let Some(eku) = cert
        .extended_key_usage()
        .map_err(|e| PkiError::CertificateError(e.to_string()))?
    {
        if eku.value.server_auth {
            extended_key_usages.push("serverAuth");
        }
        if eku.value.client_auth {
            extended_key_usages.push("clientAuth");
        }
    }

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial_hex: hex::encode(cert.raw_serial()),
        not_before: cert.validity().not_before.to_datetime(),
        not_after: cert.validity().not_after.to_datetime(),
        fingerprint: fingerprint(&der),
        is_ca,
        extended_key_usages,
    })
}
