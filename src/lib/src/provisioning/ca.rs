/// Private Certificate Authority for meter identities
///
/// One self-signed root signs every other certificate directly: the broker's
/// server identity, the backend's client identity and one client identity per
/// meter.
///
/// # Trust Chain
///
/// ```text
/// Root CA (ca.crt / ca.key, 10 years)
///   ├── server   (serverAuth)
///   ├── backend  (clientAuth)
///   └── <serial> (clientAuth, one per meter, 1 year)
/// ```
///
/// The root key is loaded once and held in memory for the life of the
/// process. Signing only reads it, so one instance can be shared between
/// request handlers behind an `Arc` without locking.
use crate::audit;
use crate::error::PkiError;
use crate::provisioning::{
    csr::CertificateRequest, random_serial, to_pem, IssuedCertificate, Identity, KeyAlgorithm,
    Role, DEFAULT_ORGANIZATION, ROOT_NAME, SERVICE_VALIDITY_DAYS,
};
use crate::store::{KeyMaterial, KeyMaterialStore};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair, SanType, SerialNumber,
};
use rustls_pki_types::{CertificateDer, CertificateSigningRequestDer};
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

/// Configuration for the root CA and the identities it issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    /// Root common name
    pub common_name: String,
    /// Organization, used for the root and every issued identity
    pub organization: String,
    /// Country code (2 letters)
    pub country: Option<String>,
    /// State/Province
    pub state: Option<String>,
    /// Root validity in days
    pub validity_days: u32,
    /// Algorithm for generated keys
    pub key_algorithm: KeyAlgorithm,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: "EnergyMeter Root CA".to_string(),
            organization: DEFAULT_ORGANIZATION.to_string(),
            country: Some("BR".to_string()),
            state: Some("SP".to_string()),
            validity_days: SERVICE_VALIDITY_DAYS,
            key_algorithm: KeyAlgorithm::EcdsaP256,
        }
    }
}

impl CaConfig {
    pub fn new(organization: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            common_name: common_name.into(),
            country: None,
            state: None,
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }
}

/// A device certificate together with the root that issued it
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    pub certificate: IssuedCertificate,
    pub ca_certificate_pem: String,
}

/// The root signing authority
pub struct CertificateAuthority {
    key_pair: KeyPair,
    /// Issuer view rebuilt from the stored root, used by rcgen to sign
    issuer: rcgen::Certificate,
    certificate_pem: String,
    certificate_der: CertificateDer<'static>,
    subject_name: String,
    organization: String,
    key_algorithm: KeyAlgorithm,
}

impl CertificateAuthority {
    /// Load the root from `store`, or create and persist it if absent.
    ///
    /// Existing material is never regenerated: doing so would orphan every
    /// certificate issued so far. A half-present pair (only `ca.crt` or only
    /// `ca.key`) is an error rather than a reason to start over.
    pub fn initialize_root(
        store: &dyn KeyMaterialStore,
        config: &CaConfig,
    ) -> Result<Self, PkiError> {
        match store.load(ROOT_NAME) {
            Ok(material) => {
                let ca = Self::from_key_material(&material, config)?;
                log::info!("Loaded existing root CA '{}'", ca.subject_name);
                Ok(ca)
            }
            Err(PkiError::NotFound(_)) => {
                log::info!("No root CA in store, generating '{}'", config.common_name);
                let (ca, material) = Self::create_root(config)?;
                store.save(ROOT_NAME, &material)?;
                Ok(ca)
            }
            Err(e) => Err(e),
        }
    }

    /// Generate a new root key pair and self-signed certificate.
    ///
    /// Returns the authority and the material to persist.
    pub fn create_root(config: &CaConfig) -> Result<(Self, KeyMaterial), PkiError> {
        let key_pair = config.key_algorithm.generate()?;
        audit::log_key_generation(config.key_algorithm.as_str(), "root");

        let mut params = CertificateParams::default();
        params.distinguished_name = Self::distinguished_name(
            &config.common_name,
            &config.organization,
            config.country.as_deref(),
            config.state.as_deref(),
        );

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(i64::from(config.validity_days));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = Role::Root.key_usages();
        params.serial_number = Some(SerialNumber::from(random_serial()?));

        let issuer = params.self_signed(&key_pair)?;
        let certificate_der = issuer.der().clone();
        let certificate_pem = to_pem("CERTIFICATE", &certificate_der);
        let material = KeyMaterial::new(certificate_pem.clone(), key_pair.serialize_pem());

        let parsed = Self::describe(&certificate_pem, &certificate_der)?;
        audit::log_identity_issued(
            Role::Root.as_str(),
            &parsed.subject_name,
            &parsed.serial_hex(),
            &parsed.fingerprint(),
        );

        Ok((
            Self {
                key_pair,
                issuer,
                certificate_pem,
                certificate_der,
                subject_name: config.common_name.clone(),
                organization: config.organization.clone(),
                key_algorithm: config.key_algorithm,
            },
            material,
        ))
    }

    /// Rebuild the authority from a stored root pair.
    ///
    /// The certificate must be a CA certificate and the key must match it.
    pub fn from_key_material(
        material: &KeyMaterial,
        config: &CaConfig,
    ) -> Result<Self, PkiError> {
        let der = crate::provisioning::certificate_der_from_pem(&material.certificate_pem)?;
        let key_pair = KeyPair::from_pem(&material.private_key_pem)
            .map_err(|e| PkiError::SigningError(format!("unreadable root key: {}", e)))?;

        let (_, cert) = X509Certificate::from_der(&der)?;
        let is_ca = cert
            .basic_constraints()
            .map_err(|e| PkiError::CertificateError(e.to_string()))?
            .map(|ext| ext.value.ca)
            .unwrap_or(false);
        if !is_ca {
            return Err(PkiError::CertificateError(
                "stored root certificate is not a CA certificate".to_string(),
            ));
        }
        if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
            return Err(PkiError::SigningError(
                "stored root key does not match the root certificate".to_string(),
            ));
        }
        let subject_name = common_name(cert.subject()).unwrap_or_default();
        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| config.organization.clone());

        let certificate_der = CertificateDer::from(der);
        let issuer = CertificateParams::from_ca_cert_der(&certificate_der)?.self_signed(&key_pair)?;

        Ok(Self {
            key_pair,
            issuer,
            certificate_pem: material.certificate_pem.clone(),
            certificate_der,
            subject_name,
            organization,
            key_algorithm: config.key_algorithm,
        })
    }

    /// Root certificate, PEM, exactly as stored
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Root certificate, DER
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    /// Root common name
    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    /// Issue a key pair and certificate for a non-root role.
    ///
    /// Server identities get `commonName` plus loopback as SANs; use
    /// [`issue_service_certificate_with_alt_names`](Self::issue_service_certificate_with_alt_names)
    /// to choose them.
    pub fn issue_service_certificate(
        &self,
        role: Role,
        common_name: &str,
        validity_days: u32,
    ) -> Result<Identity, PkiError> {
        let alt_names = match role {
            Role::Server => {
                let mut names = vec![common_name.to_string()];
                for loopback in ["localhost", "127.0.0.1"] {
                    if !names.iter().any(|n| n == loopback) {
                        names.push(loopback.to_string());
                    }
                }
                names
            }
            _ => Vec::new(),
        };
        self.issue_service_certificate_with_alt_names(role, common_name, validity_days, &alt_names)
    }

    /// Issue a key pair and certificate with explicit subject alternative
    /// names (DNS names or IP addresses).
    pub fn issue_service_certificate_with_alt_names(
        &self,
        role: Role,
        common_name: &str,
        validity_days: u32,
        alt_names: &[String],
    ) -> Result<Identity, PkiError> {
        if role == Role::Root {
            return Err(PkiError::InvalidArgument(
                "the root identity is created by initialize_root".to_string(),
            ));
        }
        if common_name.is_empty() {
            return Err(PkiError::InvalidArgument("common name is empty".to_string()));
        }

        let key_pair = self.key_algorithm.generate()?;
        audit::log_key_generation(self.key_algorithm.as_str(), role.as_str());

        let now = OffsetDateTime::now_utc();
        let mut params = self.leaf_params(
            role,
            common_name,
            now,
            now + Duration::days(i64::from(validity_days)),
        )?;
        params.subject_alt_names = alt_names
            .iter()
            .map(|name| parse_alt_name(name))
            .collect::<Result<Vec<_>, _>>()?;

        let cert = params.signed_by(&key_pair, &self.issuer, &self.key_pair)?;
        let certificate = Self::describe(&to_pem("CERTIFICATE", cert.der()), cert.der())?;

        log::info!(
            "Issued {} certificate for '{}' (serial {})",
            role,
            common_name,
            certificate.serial_hex()
        );
        audit::log_identity_issued(
            role.as_str(),
            common_name,
            &certificate.serial_hex(),
            &certificate.fingerprint(),
        );

        Ok(Identity {
            role,
            certificate,
            private_key_pem: key_pair.serialize_pem(),
        })
    }

    /// Sign a device request into a client certificate for `subject_name`.
    ///
    /// The subject is always `subject_name`, the registry-confirmed serial;
    /// the name the request claims, its SANs and any other requested
    /// extensions are discarded. The request's self-signature is checked
    /// before its key type and size. Fails closed: nothing is returned unless
    /// every check passed and the signature was produced.
    pub fn sign_request(
        &self,
        request: &CertificateRequest,
        subject_name: &str,
        validity: Duration,
    ) -> Result<SignedCertificate, PkiError> {
        request.verify_signature()?;
        request.check_public_key()?;

        if subject_name.is_empty() {
            return Err(PkiError::InvalidArgument("subject name is empty".to_string()));
        }
        if validity <= Duration::ZERO {
            return Err(PkiError::InvalidArgument("validity must be positive".to_string()));
        }

        let csr_der = CertificateSigningRequestDer::from(request.der());
        let requested = CertificateSigningRequestParams::from_der(&csr_der)
            .map_err(|e| PkiError::MalformedPublicKey(format!("unsupported request key: {}", e)))?;

        let now = OffsetDateTime::now_utc();
        let params = self.leaf_params(Role::Device, subject_name, now, now + validity)?;
        let signing = CertificateSigningRequestParams {
            params,
            public_key: requested.public_key,
        };
        let cert = signing
            .signed_by(&self.issuer, &self.key_pair)
            .map_err(|e| PkiError::SigningError(e.to_string()))?;

        let certificate = Self::describe(&to_pem("CERTIFICATE", cert.der()), cert.der())?;
        if let Some(claimed) = request.claimed_subject_name() {
            if claimed != subject_name {
                log::warn!(
                    "Request claimed subject '{}', issued for registered serial '{}'",
                    claimed,
                    subject_name
                );
            }
        }
        log::debug!(
            "Signed device certificate for '{}' (serial {}, expires {})",
            subject_name,
            certificate.serial_hex(),
            certificate.not_after
        );

        Ok(SignedCertificate {
            certificate,
            ca_certificate_pem: self.certificate_pem.clone(),
        })
    }

    fn distinguished_name(
        common_name: &str,
        organization: &str,
        country: Option<&str>,
        state: Option<&str>,
    ) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        if let Some(country) = country {
            dn.push(DnType::CountryName, country);
        }
        if let Some(state) = state {
            dn.push(DnType::StateOrProvinceName, state);
        }
        dn.push(DnType::OrganizationName, organization);
        dn.push(DnType::CommonName, common_name);
        dn
    }

    fn leaf_params(
        &self,
        role: Role,
        common_name: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<CertificateParams, PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name =
            Self::distinguished_name(common_name, &self.organization, None, None);
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = role.key_usages();
        params.extended_key_usages = role.extended_key_usages();
        params.serial_number = Some(SerialNumber::from(random_serial()?));
        Ok(params)
    }

    /// Read back the fields callers need from a freshly encoded certificate.
    fn describe(pem: &str, der: &[u8]) -> Result<IssuedCertificate, PkiError> {
        let (_, cert) = X509Certificate::from_der(der)?;
        Ok(IssuedCertificate {
            pem: pem.to_string(),
            der: der.to_vec(),
            serial_number: cert.raw_serial().to_vec(),
            subject_name: common_name(cert.subject()).unwrap_or_default(),
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
        })
    }
}

/// First common name of an X.509 name
pub(crate) fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

fn parse_alt_name(name: &str) -> Result<SanType, PkiError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = rcgen::Ia5String::try_from(name.to_string())
        .map_err(|e| PkiError::InvalidArgument(format!("invalid DNS name '{}': {}", name, e)))?;
    Ok(SanType::DnsName(dns))
}
