/// Device-side provisioning
///
/// On boot a meter either finds its identity in local storage or obtains
/// one: it generates a key pair, sends a CSR with its serial number, checks
/// the answer and stores `<serial>.key`, `<serial>.crt` and `ca.crt`.
///
/// Nothing is written until the returned certificate has been verified
/// against the returned (or pinned) root and shown to certify the freshly
/// generated key.
use crate::error::PkiError;
use crate::provisioning::{
    certificate_der_from_pem, csr::generate_request, device::validate_serial,
    session::ProvisioningService, verification::IdentityVerifier, ErrorResponse, KeyAlgorithm,
    ProvisioningRequest, ProvisioningResponse, ROOT_NAME,
};
use crate::store::{KeyMaterial, KeyMaterialStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Path of the provisioning endpoint
pub const PROVISION_PATH: &str = "/devices/provision";

/// How a device reaches the provisioning service
pub trait ProvisioningTransport: Send + Sync {
    fn request_certificate(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, PkiError>;
}

/// HTTP transport (`POST <base>/devices/provision`)
pub struct HttpTransport {
    base_url: String,
    client: ureq::Agent,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        // Non-2xx answers come back as responses so their message can be read
        let client = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, PROVISION_PATH)
    }
}

impl ProvisioningTransport for HttpTransport {
    fn request_certificate(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, PkiError> {
        let url = self.endpoint();
        let body = serde_json::to_vec(request)
            .map_err(|e| PkiError::InternalError(format!("cannot encode request: {}", e)))?;

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .send(&body[..])
            .map_err(|e| PkiError::HttpError(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .into_body()
            .read_to_string()
            .map_err(|e| PkiError::HttpError(format!("cannot read response: {}", e)))?;

        if status == 200 || status == 201 {
            return serde_json::from_str(&text).map_err(|e| {
                PkiError::HttpError(format!("unexpected provisioning response: {}", e))
            });
        }

        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.message)
            .unwrap_or(text);
        if status == 404 {
            Err(PkiError::UnknownDevice(request.serial_number.clone()))
        } else {
            Err(PkiError::SigningError(format!(
                "provisioning endpoint returned {}: {}",
                status, message
            )))
        }
    }
}

/// In-process transport calling a [`ProvisioningService`] directly
pub struct LocalTransport {
    service: Arc<ProvisioningService>,
}

impl LocalTransport {
    pub fn new(service: Arc<ProvisioningService>) -> Self {
        Self { service }
    }
}

impl ProvisioningTransport for LocalTransport {
    fn request_certificate(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, PkiError> {
        self.service.provision(request)
    }
}

/// Exponential backoff for the boot path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (1-based), doubling up to `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Whether a failure may clear up by asking again later.
fn is_retryable(err: &PkiError) -> bool {
    matches!(
        err,
        PkiError::UnknownDevice(_)
            | PkiError::SigningError(_)
            | PkiError::HttpError(_)
            | PkiError::MalformedRequest(_)
            | PkiError::CertificateError(_)
    )
}

/// A device's stored identity
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub serial_number: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub ca_certificate_pem: String,
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("serial_number", &self.serial_number)
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"[REDACTED]")
            .field("ca_certificate_pem", &self.ca_certificate_pem)
            .finish()
    }
}

/// Obtains and keeps a device identity
pub struct DeviceProvisioner<T: ProvisioningTransport> {
    serial_number: String,
    transport: T,
    store: Arc<dyn KeyMaterialStore>,
    key_algorithm: KeyAlgorithm,
    pinned_root_der: Option<Vec<u8>>,
}

impl<T: ProvisioningTransport> DeviceProvisioner<T> {
    pub fn new(
        serial_number: impl Into<String>,
        transport: T,
        store: Arc<dyn KeyMaterialStore>,
    ) -> Result<Self, PkiError> {
        let serial_number = serial_number.into();
        validate_serial(&serial_number)?;
        Ok(Self {
            serial_number,
            transport,
            store,
            key_algorithm: KeyAlgorithm::default(),
            pinned_root_der: None,
        })
    }

    pub fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    /// Only accept answers whose root is exactly this certificate.
    pub fn with_trust_anchor(mut self, root_pem: &str) -> Result<Self, PkiError> {
        self.pinned_root_der = Some(certificate_der_from_pem(root_pem)?);
        Ok(self)
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Stored identity, if all three files are present.
    pub fn load(&self) -> Result<Option<DeviceCredentials>, PkiError> {
        let material = match self.store.load(&self.serial_number) {
            Ok(material) => material,
            Err(PkiError::NotFound(_)) | Err(PkiError::IncompleteKeyMaterial(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let ca_certificate_pem = match self.store.load_certificate(ROOT_NAME) {
            Ok(pem) => pem,
            Err(PkiError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(DeviceCredentials {
            serial_number: self.serial_number.clone(),
            certificate_pem: material.certificate_pem,
            private_key_pem: material.private_key_pem,
            ca_certificate_pem,
        }))
    }

    /// Run one provisioning exchange and persist the result.
    pub fn provision(&self) -> Result<DeviceCredentials, PkiError> {
        let generated = generate_request(&self.serial_number, self.key_algorithm)?;
        log::info!(
            "Requesting certificate for {} ({} key)",
            self.serial_number,
            self.key_algorithm.as_str()
        );

        let response = self.transport.request_certificate(&ProvisioningRequest {
            serial_number: self.serial_number.clone(),
            csr: generated.csr_pem.clone(),
        })?;

        self.check_response(&response, &generated.private_key_pem)?;

        self.store.save(
            &self.serial_number,
            &KeyMaterial::new(response.certificate.clone(), generated.private_key_pem.clone()),
        )?;
        self.store
            .save_certificate(ROOT_NAME, &response.ca_certificate)?;
        log::info!("Stored identity for {}", self.serial_number);

        Ok(DeviceCredentials {
            serial_number: self.serial_number.clone(),
            certificate_pem: response.certificate,
            private_key_pem: generated.private_key_pem,
            ca_certificate_pem: response.ca_certificate,
        })
    }

    fn check_response(
        &self,
        response: &ProvisioningResponse,
        private_key_pem: &str,
    ) -> Result<(), PkiError> {
        let root_der = certificate_der_from_pem(&response.ca_certificate)?;
        if let Some(pinned) = &self.pinned_root_der {
            if pinned != &root_der {
                return Err(PkiError::CertificateError(
                    "returned CA certificate does not match the pinned trust anchor".to_string(),
                ));
            }
        }

        let cert_der = certificate_der_from_pem(&response.certificate)?;
        IdentityVerifier::new(&root_der)?.verify_device(&cert_der, &self.serial_number, None)?;

        let key_pair = rcgen::KeyPair::from_pem(private_key_pem)
            .map_err(|e| PkiError::InternalError(format!("cannot reload generated key: {}", e)))?;
        let (_, cert) = X509Certificate::from_der(&cert_der)?;
        if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
            return Err(PkiError::CertificateError(
                "returned certificate does not certify the generated key".to_string(),
            ));
        }
        Ok(())
    }

    /// Stored identity, or a new one from a single exchange.
    pub fn load_or_provision(&self) -> Result<DeviceCredentials, PkiError> {
        if let Some(credentials) = self.load()? {
            log::debug!("Using stored identity for {}", self.serial_number);
            return Ok(credentials);
        }
        self.provision()
    }

    /// Like [`load_or_provision`](Self::load_or_provision), retrying
    /// remote failures with backoff. Local storage failures are returned
    /// immediately.
    pub fn load_or_provision_with_retry(
        &self,
        policy: &RetryPolicy,
    ) -> Result<DeviceCredentials, PkiError> {
        if let Some(credentials) = self.load()? {
            return Ok(credentials);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.provision() {
                Ok(credentials) => return Ok(credentials),
                Err(e) => e,
            };
            if !is_retryable(&err) || policy.exhausted(attempt) {
                return Err(err);
            }

            let delay = policy.delay_after(attempt);
            match &err {
                PkiError::UnknownDevice(_) => log::warn!(
                    "Device {} is not registered yet; retrying in {:?}",
                    self.serial_number,
                    delay
                ),
                other => log::warn!(
                    "Provisioning attempt {} failed ({}); retrying in {:?}",
                    attempt,
                    other,
                    delay
                ),
            }
            std::thread::sleep(delay);
        }
    }
}
