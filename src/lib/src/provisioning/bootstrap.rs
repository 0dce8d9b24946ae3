/// One-time operator setup
///
/// Creates (or loads) the root and the two long-lived service identities:
///
/// - `server`: broker-facing, `serverAuth`, SANs from the configuration
/// - `backend`: backend service client, `clientAuth`
///
/// Running it again changes nothing. Identities already in the store are
/// kept as they are; a half-written one is reported, never overwritten.
use crate::config::{BackendTlsEnv, PkiConfig};
use crate::error::PkiError;
use crate::provisioning::{ca::CertificateAuthority, Identity, Role, BACKEND_NAME, SERVER_NAME};
use crate::store::{KeyMaterial, KeyMaterialStore};

/// What bootstrap found or created
pub struct BootstrapReport {
    pub authority: CertificateAuthority,
    pub server: KeyMaterial,
    pub backend: KeyMaterial,
    pub server_created: bool,
    pub backend_created: bool,
}

impl BootstrapReport {
    /// Trust material the backend needs
    pub fn backend_env(&self) -> BackendTlsEnv {
        BackendTlsEnv {
            ca_certificate_pem: self.authority.certificate_pem().to_string(),
            certificate_pem: self.backend.certificate_pem.clone(),
            private_key_pem: self.backend.private_key_pem.clone(),
        }
    }

    /// `NAME=value` lines for the backend environment. Never includes the
    /// root key.
    pub fn env_exports(&self) -> Vec<String> {
        self.backend_env()
            .exports()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect()
    }
}

/// Initialize the root and the service identities in `store`.
pub fn bootstrap(
    store: &dyn KeyMaterialStore,
    config: &PkiConfig,
) -> Result<BootstrapReport, PkiError> {
    let authority = CertificateAuthority::initialize_root(store, &config.ca_config())?;
    let identities = &config.identities;

    let (server, server_created) = ensure_identity(store, SERVER_NAME, || {
        authority.issue_service_certificate_with_alt_names(
            Role::Server,
            &identities.server_common_name,
            identities.service_validity_days,
            &identities.server_alt_names,
        )
    })?;
    let (backend, backend_created) = ensure_identity(store, BACKEND_NAME, || {
        authority.issue_service_certificate(
            Role::BackendService,
            &identities.backend_common_name,
            identities.service_validity_days,
        )
    })?;

    Ok(BootstrapReport {
        authority,
        server,
        backend,
        server_created,
        backend_created,
    })
}

fn ensure_identity<F>(
    store: &dyn KeyMaterialStore,
    name: &str,
    issue: F,
) -> Result<(KeyMaterial, bool), PkiError>
where
    F: FnOnce() -> Result<Identity, PkiError>,
{
    match store.load(name) {
        Ok(material) => {
            log::info!("Identity '{}' already present, keeping it", name);
            Ok((material, false))
        }
        Err(PkiError::NotFound(_)) => {
            let material = issue()?.key_material();
            store.save(name, &material)?;
            log::info!("Created identity '{}'", name);
            Ok((material, true))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::{certificate_der_from_pem, IdentityVerifier, ROOT_NAME};
    use crate::store::{FileKeyStore, MemoryKeyStore};

    #[test]
    fn test_bootstrap_creates_everything_once() {
        let store = MemoryKeyStore::new();
        let config = PkiConfig::default();

        let first = bootstrap(&store, &config).unwrap();
        assert!(first.server_created);
        assert!(first.backend_created);
        assert!(store.exists(ROOT_NAME).unwrap());

        let second = bootstrap(&store, &config).unwrap();
        assert!(!second.server_created);
        assert!(!second.backend_created);
        assert_eq!(second.server, first.server);
        assert_eq!(second.backend, first.backend);
        assert_eq!(
            second.authority.certificate_pem(),
            first.authority.certificate_pem()
        );
    }

    #[test]
    fn test_bootstrap_identities_verify() {
        let store = MemoryKeyStore::new();
        let report = bootstrap(&store, &PkiConfig::default()).unwrap();
        let verifier = IdentityVerifier::from_pem(report.authority.certificate_pem()).unwrap();

        let server = certificate_der_from_pem(&report.server.certificate_pem).unwrap();
        assert_eq!(
            verifier.verify_server(&server, None).unwrap().subject_name,
            "localhost"
        );
        let backend = certificate_der_from_pem(&report.backend.certificate_pem).unwrap();
        assert_eq!(
            verifier.verify_client(&backend, None).unwrap().subject_name,
            "backend-system"
        );
    }

    #[test]
    fn test_env_exports_exclude_root_key() {
        let store = MemoryKeyStore::new();
        let report = bootstrap(&store, &PkiConfig::default()).unwrap();
        let root_key = store.load(ROOT_NAME).unwrap().private_key_pem;

        let exports = report.env_exports();
        assert_eq!(exports.len(), 3);
        assert!(exports[0].starts_with("CA_CERT_B64="));
        assert!(exports[1].starts_with("BACKEND_CERT_B64="));
        assert!(exports[2].starts_with("BACKEND_KEY_B64="));

        let encoded_root_key = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode(&root_key)
        };
        assert!(exports.iter().all(|line| !line.contains(&encoded_root_key)));
    }

    #[test]
    fn test_half_written_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        let report = bootstrap(&store, &PkiConfig::default()).unwrap();

        std::fs::remove_file(store.key_path(BACKEND_NAME)).unwrap();
        assert!(matches!(
            bootstrap(&store, &PkiConfig::default()),
            Err(PkiError::IncompleteKeyMaterial(_))
        ));
        // The surviving certificate was left alone
        assert_eq!(
            store.load_certificate(BACKEND_NAME).unwrap(),
            report.backend.certificate_pem
        );
    }
}
