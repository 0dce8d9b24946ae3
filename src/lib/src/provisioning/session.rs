/// Provisioning workflow
///
/// The authorization gate between an unauthenticated device and a signed
/// identity. Each call is one-shot and keeps no state between steps:
///
/// 1. Look up the serial number in the registry (`UnknownDevice` if absent)
/// 2. Parse the CSR (`MalformedRequest`)
/// 3. Have the CA check and sign it for the registered serial
/// 4. Return the certificate and the root certificate
///
/// A failed or abandoned call leaves nothing behind, so devices simply retry
/// the whole exchange.
use crate::audit;
use crate::error::PkiError;
use crate::provisioning::{
    ca::CertificateAuthority, csr::CertificateRequest, device::DeviceRegistry,
    ProvisioningRequest, ProvisioningResponse, DEVICE_VALIDITY_DAYS,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use time::Duration;

/// Issues device certificates for registered serial numbers
pub struct ProvisioningService {
    ca: Arc<CertificateAuthority>,
    registry: Arc<dyn DeviceRegistry>,
    device_validity: Duration,
    stats: Mutex<ProvisioningStats>,
}

impl ProvisioningService {
    /// Service issuing 1-year device certificates
    pub fn new(ca: Arc<CertificateAuthority>, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            ca,
            registry,
            device_validity: Duration::days(i64::from(DEVICE_VALIDITY_DAYS)),
            stats: Mutex::new(ProvisioningStats::new()),
        }
    }

    /// Set device certificate validity
    pub fn with_device_validity_days(mut self, days: u32) -> Self {
        self.device_validity = Duration::days(i64::from(days));
        self
    }

    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Provision a device.
    ///
    /// The returned error carries the precise cause for local callers. It
    /// must not be forwarded verbatim to the device; see
    /// [`server`](crate::server) for the public mapping.
    pub fn provision(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, PkiError> {
        let start = Instant::now();
        let correlation_id = audit::new_correlation_id();
        let serial = request.serial_number.as_str();

        log::info!("Provisioning request for device {}", serial);
        audit::log_provisioning_attempt(&correlation_id, serial);

        let result = self.run(request);
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                self.record(|stats| stats.record_success(elapsed_ms));
            }
            Err(e) => {
                match e {
                    PkiError::UnknownDevice(_) => {
                        log::warn!("Rejected provisioning for unregistered device {}", serial);
                        audit::log_provisioning_rejected(&correlation_id, serial);
                    }
                    PkiError::InvalidRequestSignature => {
                        log::warn!(
                            "Request signature for device {} does not verify: possible tampering",
                            serial
                        );
                        audit::log_provisioning_tamper(&correlation_id, serial);
                    }
                    other => {
                        log::error!("Provisioning failed for device {}: {}", serial, other);
                        audit::log_provisioning_failure(
                            &correlation_id,
                            serial,
                            other.kind(),
                            &other.to_string(),
                        );
                    }
                }
                let kind = e.kind();
                self.record(|stats| stats.record_failure(kind, elapsed_ms));
            }
        }

        let (response, certificate) = result?;
        audit::log_provisioning_success(
            &correlation_id,
            serial,
            &certificate.serial_hex(),
            &certificate.fingerprint(),
        );
        log::info!(
            "Issued certificate {} to device {} in {}ms",
            certificate.serial_hex(),
            serial,
            elapsed_ms
        );
        Ok(response)
    }

    /// Provision from a raw JSON body. Undecodable bodies are
    /// `MalformedRequest` and go through the same accounting as other
    /// failures.
    pub fn provision_json(&self, body: &[u8]) -> Result<ProvisioningResponse, PkiError> {
        match serde_json::from_slice::<ProvisioningRequest>(body) {
            Ok(request) => self.provision(&request),
            Err(e) => {
                let err = PkiError::MalformedRequest(format!("invalid request body: {}", e));
                log::warn!("Rejected provisioning request: {}", err);
                audit::log_provisioning_failure(
                    &audit::new_correlation_id(),
                    "unknown",
                    err.kind(),
                    &err.to_string(),
                );
                self.record(|stats| stats.record_failure(err.kind(), 0));
                Err(err)
            }
        }
    }

    fn run(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<(ProvisioningResponse, crate::provisioning::IssuedCertificate), PkiError> {
        let record = self
            .registry
            .find_by_serial(&request.serial_number)?
            .ok_or_else(|| PkiError::UnknownDevice(request.serial_number.clone()))?;
        log::debug!("Device {} found in registry", record);

        let csr = CertificateRequest::from_pem(&request.csr)?;
        let signed = self
            .ca
            .sign_request(&csr, &record.serial_number, self.device_validity)?;

        Ok((
            ProvisioningResponse {
                certificate: signed.certificate.pem.clone(),
                ca_certificate: signed.ca_certificate_pem,
            },
            signed.certificate,
        ))
    }

    fn record(&self, update: impl FnOnce(&mut ProvisioningStats)) {
        match self.stats.lock() {
            Ok(mut stats) => update(&mut stats),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ProvisioningStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Provisioning counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningStats {
    /// Total requests handled
    pub total_requests: usize,
    /// Certificates issued
    pub issued: usize,
    /// Failed requests
    pub failed: usize,
    /// Failures by error kind (`unknown_device`, `invalid_request_signature`, ...)
    pub failures_by_kind: BTreeMap<&'static str, usize>,
    /// Average handling time (milliseconds)
    pub avg_time_ms: u64,
}

impl ProvisioningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, duration_ms: u64) {
        self.total_requests += 1;
        self.issued += 1;
        self.update_avg_time(duration_ms);
    }

    pub fn record_failure(&mut self, kind: &'static str, duration_ms: u64) {
        self.total_requests += 1;
        self.failed += 1;
        *self.failures_by_kind.entry(kind).or_insert(0) += 1;
        self.update_avg_time(duration_ms);
    }

    fn update_avg_time(&mut self, duration_ms: u64) {
        let total = self.total_requests as u64;
        if total == 1 {
            self.avg_time_ms = duration_ms;
        } else {
            self.avg_time_ms = (self.avg_time_ms * (total - 1) + duration_ms) / total;
        }
    }

    /// Success rate (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.issued as f64 / self.total_requests as f64
        }
    }

    pub fn failures_of(&self, kind: &str) -> usize {
        self.failures_by_kind.get(kind).copied().unwrap_or(0)
    }
}
