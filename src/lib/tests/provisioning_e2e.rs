//! End-to-end tests for device provisioning
//!
//! These tests run the complete flow on real files and sockets:
//! 1. Bootstrap the root, server and backend identities
//! 2. Serve the provisioning endpoint over HTTP
//! 3. Provision a device and persist its identity
//! 4. Complete a mutual-TLS handshake with the stored identity

use meterpki::{
    channel::{self, Credentials, TrustAnchor},
    config::PkiConfig,
    provisioning::{
        self, generate_request, inspect_certificate, CaConfig, CertificateAuthority,
        CertificateRequest, DeviceProvisioner, DeviceRecord, HttpTransport, IdentityVerifier,
        JsonDeviceRegistry, KeyAlgorithm, ProvisioningRequest, ProvisioningService, RetryPolicy,
        ROOT_NAME, SERVER_NAME,
    },
    store::{FileKeyStore, KeyMaterialStore},
    PkiError,
};
use rustls::{ServerConnection, StreamOwned};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

struct Deployment {
    _dir: tempfile::TempDir,
    store: FileKeyStore,
    service: Arc<ProvisioningService>,
}

/// Bootstrap a CA on disk with `central_simulada_01` registered
fn deploy() -> Deployment {
    let dir = tempfile::tempdir().unwrap();
    let store = FileKeyStore::open(dir.path().join("certs")).unwrap();
    let report = provisioning::bootstrap(&store, &PkiConfig::default()).unwrap();

    let registry = JsonDeviceRegistry::open(dir.path().join("devices.json")).unwrap();
    registry
        .register(DeviceRecord::new("central_simulada_01").unwrap())
        .unwrap();

    let service = Arc::new(ProvisioningService::new(
        Arc::new(report.authority),
        Arc::new(registry),
    ));
    Deployment {
        _dir: dir,
        store,
        service,
    }
}

/// Serve the provisioning endpoint on an ephemeral port
fn spawn_endpoint(service: Arc<ProvisioningService>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, meterpki::server::router(service))
                .await
                .unwrap();
        });
    });

    format!("http://{}", addr)
}

fn certificate_der(pem_str: &str) -> Vec<u8> {
    pem::parse(pem_str).unwrap().into_contents()
}

/// Stored files, not counting the store's lock file
fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name() != meterpki::store::LOCK_FILE_NAME)
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn test_device_provisioning_and_mutual_tls() {
    let deployment = deploy();
    let url = spawn_endpoint(deployment.service.clone());

    // Device side
    let device_dir = tempfile::tempdir().unwrap();
    let device_store = Arc::new(FileKeyStore::open(device_dir.path()).unwrap());
    let provisioner = DeviceProvisioner::new(
        "central_simulada_01",
        HttpTransport::new(url),
        device_store.clone(),
    )
    .unwrap()
    .with_trust_anchor(&deployment.store.load_certificate(ROOT_NAME).unwrap())
    .unwrap();

    let credentials = provisioner
        .load_or_provision_with_retry(&RetryPolicy::no_retry())
        .unwrap();
    assert!(device_store.key_path("central_simulada_01").exists());
    assert!(device_store.certificate_path("central_simulada_01").exists());
    assert!(device_store.certificate_path(ROOT_NAME).exists());

    let info = inspect_certificate(&credentials.certificate_pem).unwrap();
    assert!(info.subject.contains("CN=central_simulada_01"));
    assert_eq!(info.extended_key_usages, vec!["clientAuth"]);

    // Broker side, from the bootstrap identities
    let server_config = channel::build_server_config(
        &TrustAnchor::from_store(&deployment.store, ROOT_NAME).unwrap(),
        &Credentials::from_store(&deployment.store, SERVER_NAME).unwrap(),
    )
    .unwrap();
    let broker = TcpListener::bind("127.0.0.1:0").unwrap();
    let broker_addr = broker.local_addr().unwrap();
    let accepted = std::thread::spawn(move || -> Result<Vec<u8>, String> {
        let (sock, _) = broker.accept().map_err(|e| e.to_string())?;
        let conn = ServerConnection::new(server_config).map_err(|e| e.to_string())?;
        let mut tls = StreamOwned::new(conn, sock);
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(|e| e.to_string())?;
        }
        tls.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
            .ok_or_else(|| "no client certificate".to_string())
    });

    // Device connects with what it stored
    let client = channel::build_client_config(
        &TrustAnchor::from_store(device_store.as_ref(), ROOT_NAME).unwrap(),
        &Credentials::from_store(device_store.as_ref(), "central_simulada_01").unwrap(),
        "central_simulada_01",
    )
    .unwrap();
    let stream = client.connect(broker_addr, "localhost").unwrap();

    let peer = accepted.join().unwrap().unwrap();
    assert_eq!(peer, certificate_der(&credentials.certificate_pem));
    assert!(stream.conn.peer_certificates().is_some());
    let verifier = IdentityVerifier::from_pem(&credentials.ca_certificate_pem).unwrap();
    assert_eq!(
        verifier
            .verify_device(&peer, "central_simulada_01", None)
            .unwrap()
            .subject_name,
        "central_simulada_01"
    );

    // A reboot reuses the stored identity without contacting the endpoint
    let issued_before = deployment.service.stats().issued;
    let again = provisioner.load_or_provision().unwrap();
    assert_eq!(again, credentials);
    assert_eq!(deployment.service.stats().issued, issued_before);
}

#[test]
fn test_unregistered_device_gets_nothing() {
    let deployment = deploy();
    let url = spawn_endpoint(deployment.service.clone());

    let device_dir = tempfile::tempdir().unwrap();
    let device_store = Arc::new(FileKeyStore::open(device_dir.path()).unwrap());
    let provisioner =
        DeviceProvisioner::new("ghost-01", HttpTransport::new(url), device_store).unwrap();

    let err = provisioner
        .load_or_provision_with_retry(&RetryPolicy::no_retry())
        .unwrap_err();
    assert!(matches!(err, PkiError::UnknownDevice(_)));
    assert_eq!(files_in(device_dir.path()), 0);
    assert_eq!(deployment.service.stats().failures_of("unknown_device"), 1);
}

#[test]
fn test_device_registered_while_serving_is_provisioned() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileKeyStore::open(dir.path().join("certs")).unwrap();
    let report = provisioning::bootstrap(&store, &PkiConfig::default()).unwrap();
    let registry_path = dir.path().join("devices.json");

    let serving_registry = JsonDeviceRegistry::open(&registry_path).unwrap();
    let service = Arc::new(ProvisioningService::new(
        Arc::new(report.authority),
        Arc::new(serving_registry),
    ));
    let url = spawn_endpoint(service.clone());

    let device_dir = tempfile::tempdir().unwrap();
    let device_store = Arc::new(FileKeyStore::open(device_dir.path()).unwrap());
    let provisioner = DeviceProvisioner::new(
        "meter-late-01",
        HttpTransport::new(url),
        device_store.clone(),
    )
    .unwrap();

    let err = provisioner
        .load_or_provision_with_retry(&RetryPolicy::no_retry())
        .unwrap_err();
    assert!(matches!(err, PkiError::UnknownDevice(_)));

    // The operator registers the meter through a separate handle
    JsonDeviceRegistry::open(&registry_path)
        .unwrap()
        .register(DeviceRecord::new("meter-late-01").unwrap())
        .unwrap();

    let credentials = provisioner
        .load_or_provision_with_retry(&RetryPolicy::no_retry())
        .unwrap();
    let info = inspect_certificate(&credentials.certificate_pem).unwrap();
    assert!(info.subject.contains("CN=meter-late-01"));
    assert_eq!(service.stats().issued, 1);
}

#[test]
fn test_tampered_request_is_rejected() {
    let deployment = deploy();
    let generated = generate_request("central_simulada_01", KeyAlgorithm::EcdsaP256).unwrap();
    let request = CertificateRequest::from_pem(&generated.csr_pem).unwrap();

    let mut der = request.der().to_vec();
    let last = der.len() - 1;
    der[last] ^= 0x01;
    let tampered = CertificateRequest::from_der(der).unwrap();

    let err = deployment
        .service
        .provision(&ProvisioningRequest {
            serial_number: "central_simulada_01".to_string(),
            csr: tampered.to_pem(),
        })
        .unwrap_err();
    assert!(matches!(err, PkiError::InvalidRequestSignature));
    assert_eq!(
        deployment
            .service
            .stats()
            .failures_of("invalid_request_signature"),
        1
    );
}

#[test]
fn test_claimed_subject_is_replaced_by_registered_serial() {
    let deployment = deploy();
    let generated = generate_request("admin", KeyAlgorithm::EcdsaP256).unwrap();

    let response = deployment
        .service
        .provision(&ProvisioningRequest {
            serial_number: "central_simulada_01".to_string(),
            csr: generated.csr_pem,
        })
        .unwrap();

    let info = inspect_certificate(&response.certificate).unwrap();
    assert!(info.subject.contains("CN=central_simulada_01"));
    assert!(!info.subject.contains("admin"));
}

#[test]
fn test_response_never_carries_private_keys() {
    let deployment = deploy();
    let root_key = deployment.store.load(ROOT_NAME).unwrap().private_key_pem;
    let generated = generate_request("central_simulada_01", KeyAlgorithm::EcdsaP256).unwrap();

    let response = deployment
        .service
        .provision(&ProvisioningRequest {
            serial_number: "central_simulada_01".to_string(),
            csr: generated.csr_pem,
        })
        .unwrap();
    let json = serde_json::to_string(&response).unwrap();

    assert!(!json.contains("PRIVATE KEY"));
    assert!(!json.contains(root_key.trim()));
}

#[test]
fn test_root_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileKeyStore::open(dir.path()).unwrap();
    let config = CaConfig::default();

    let first = CertificateAuthority::initialize_root(&store, &config).unwrap();
    let backend = first
        .issue_service_certificate(provisioning::Role::BackendService, "backend-system", 30)
        .unwrap();
    drop(first);

    let reopened = FileKeyStore::open(dir.path()).unwrap();
    let second = CertificateAuthority::initialize_root(&reopened, &config).unwrap();
    let verifier = IdentityVerifier::new(second.certificate_der()).unwrap();
    assert!(verifier.verify_client(&backend.certificate.der, None).is_ok());
}

#[test]
fn test_concurrent_provisioning_issues_unique_serials() {
    let serials: Vec<String> = (0..8).map(|i| format!("meter-{:02}", i)).collect();
    let registry = Arc::new(
        provisioning::MemoryDeviceRegistry::with_serials(serials.iter().cloned()).unwrap(),
    );
    let (authority, _) = CertificateAuthority::create_root(&CaConfig::default()).unwrap();
    let service = Arc::new(ProvisioningService::new(Arc::new(authority), registry));

    let handles: Vec<_> = serials
        .iter()
        .cloned()
        .map(|serial| {
            let service = service.clone();
            std::thread::spawn(move || {
                let generated = generate_request(&serial, KeyAlgorithm::EcdsaP256).unwrap();
                let response = service
                    .provision(&ProvisioningRequest {
                        serial_number: serial,
                        csr: generated.csr_pem,
                    })
                    .unwrap();
                inspect_certificate(&response.certificate).unwrap().serial_hex
            })
        })
        .collect();

    let mut issued: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    issued.sort();
    issued.dedup();
    assert_eq!(issued.len(), serials.len());
    assert_eq!(service.stats().issued, serials.len());
}
