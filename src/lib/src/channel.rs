//! Mutual-TLS configuration for the broker, the backend and devices.
//!
//! Every party trusts exactly the private root and presents its own
//! certificate. There is no anonymous mode: server configurations always
//! demand a client certificate, and credentials are accepted only as a
//! complete certificate and key pair.

use crate::error::PkiError;
use crate::store::{KeyMaterial, KeyMaterialStore};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, StreamOwned};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

/// Prefix of backend connection identifiers
pub const BACKEND_CLIENT_PREFIX: &str = "backend-service-";

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Root certificates a party validates its peers against
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    certificates: Vec<CertificateDer<'static>>,
}

impl TrustAnchor {
    /// Parse one or more PEM `CERTIFICATE` blocks.
    pub fn from_pem(pem_str: &str) -> Result<Self, PkiError> {
        let certificates: Vec<_> = pem::parse_many(pem_str)?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| CertificateDer::from(block.into_contents()))
            .collect();
        if certificates.is_empty() {
            return Err(PkiError::ConfigError(
                "trust anchor contains no certificate".to_string(),
            ));
        }
        Ok(Self { certificates })
    }

    /// Load the cached root certificate stored under `name`.
    pub fn from_store(store: &dyn KeyMaterialStore, name: &str) -> Result<Self, PkiError> {
        Self::from_pem(&store.load_certificate(name)?)
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    fn root_store(&self) -> Result<RootCertStore, PkiError> {
        let mut roots = RootCertStore::empty();
        for cert in &self.certificates {
            roots
                .add(cert.clone())
                .map_err(|e| PkiError::TlsError(format!("unusable trust anchor: {}", e)))?;
        }
        Ok(roots)
    }
}

/// A certificate chain and the private key for its leaf
pub struct Credentials {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Credentials {
    /// Both halves are required. The key may be PKCS#8, SEC1 or PKCS#1.
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self, PkiError> {
        let chain: Vec<_> = pem::parse_many(certificate_pem)?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| CertificateDer::from(block.into_contents()))
            .collect();
        if chain.is_empty() {
            return Err(PkiError::ConfigError(
                "credentials contain no certificate".to_string(),
            ));
        }

        let mut keys = pem::parse_many(private_key_pem)?
            .into_iter()
            .filter_map(|block| match block.tag() {
                "PRIVATE KEY" => Some(PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
                    block.into_contents(),
                ))),
                "EC PRIVATE KEY" => Some(PrivateKeyDer::from(PrivateSec1KeyDer::from(
                    block.into_contents(),
                ))),
                "RSA PRIVATE KEY" => Some(PrivateKeyDer::from(PrivatePkcs1KeyDer::from(
                    block.into_contents(),
                ))),
                _ => None,
            });
        let key = keys
            .next()
            .ok_or_else(|| PkiError::ConfigError("credentials contain no private key".to_string()))?;
        if keys.next().is_some() {
            return Err(PkiError::ConfigError(
                "credentials contain more than one private key".to_string(),
            ));
        }

        Ok(Self { chain, key })
    }

    pub fn from_key_material(material: &KeyMaterial) -> Result<Self, PkiError> {
        Self::from_pem(&material.certificate_pem, &material.private_key_pem)
    }

    pub fn from_store(store: &dyn KeyMaterialStore, name: &str) -> Result<Self, PkiError> {
        Self::from_key_material(&store.load(name)?)
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("chain_len", &self.chain.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Server side: present `credentials`, require a client certificate
/// issued under `anchor`.
pub fn build_server_config(
    anchor: &TrustAnchor,
    credentials: &Credentials,
) -> Result<Arc<ServerConfig>, PkiError> {
    let provider = crypto_provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(anchor.root_store()?), provider.clone())
            .build()
            .map_err(|e| PkiError::TlsError(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(credentials.chain.clone(), credentials.key.clone_key())?;

    Ok(Arc::new(config))
}

/// Client side: present `credentials`, accept only servers issued under
/// `anchor`.
///
/// `identity_hint` is carried along for log correlation; it plays no part
/// in authentication.
pub fn build_client_config(
    anchor: &TrustAnchor,
    credentials: &Credentials,
    identity_hint: impl Into<String>,
) -> Result<MtlsClient, PkiError> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(anchor.root_store()?)
        .with_client_auth_cert(credentials.chain.clone(), credentials.key.clone_key())?;

    Ok(MtlsClient {
        config: Arc::new(config),
        client_id: identity_hint.into(),
    })
}

/// `backend-service-` followed by six random hex digits
pub fn backend_client_id() -> Result<String, PkiError> {
    let mut suffix = [0u8; 3];
    getrandom::fill(&mut suffix)
        .map_err(|e| PkiError::InternalError(format!("OS RNG unavailable: {}", e)))?;
    Ok(format!("{}{}", BACKEND_CLIENT_PREFIX, hex::encode(suffix)))
}

/// Client configuration plus its connection identifier
#[derive(Debug, Clone)]
pub struct MtlsClient {
    config: Arc<ClientConfig>,
    client_id: String,
}

impl MtlsClient {
    pub fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Open a TCP connection and complete the handshake.
    pub fn connect(
        &self,
        addr: impl ToSocketAddrs,
        server_name: &str,
    ) -> Result<StreamOwned<ClientConnection, TcpStream>, PkiError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| PkiError::InvalidArgument(format!("server name '{}': {}", server_name, e)))?;
        let conn = ClientConnection::new(self.config.clone(), name)?;
        let sock = TcpStream::connect(addr)?;

        let mut stream = StreamOwned::new(conn, sock);
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock).map_err(|e| {
                PkiError::TlsError(format!("handshake with {} failed: {}", server_name, e))
            })?;
        }
        log::info!(
            "Mutual TLS established with {} as {}",
            server_name,
            self.client_id
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::{CaConfig, CertificateAuthority, Identity, Role};
    use crate::store::MemoryKeyStore;
    use rustls::ServerConnection;

    struct Pki {
        ca: CertificateAuthority,
        anchor: TrustAnchor,
        server: Identity,
    }

    fn pki() -> Pki {
        let (ca, _) = CertificateAuthority::create_root(&CaConfig::default()).unwrap();
        let anchor = TrustAnchor::from_pem(ca.certificate_pem()).unwrap();
        let server = ca
            .issue_service_certificate(Role::Server, "localhost", 30)
            .unwrap();
        Pki { ca, anchor, server }
    }

    fn credentials(identity: &Identity) -> Credentials {
        Credentials::from_pem(&identity.certificate.pem, &identity.private_key_pem).unwrap()
    }

    fn pump(
        client: &mut ClientConnection,
        server: &mut ServerConnection,
    ) -> Result<(), rustls::Error> {
        for _ in 0..16 {
            if !client.is_handshaking() && !server.is_handshaking() {
                return Ok(());
            }

            let mut buf = Vec::new();
            while client.wants_write() {
                client.write_tls(&mut buf).unwrap();
            }
            let mut rd = &buf[..];
            while !rd.is_empty() {
                server.read_tls(&mut rd).unwrap();
                server.process_new_packets()?;
            }

            let mut buf = Vec::new();
            while server.wants_write() {
                server.write_tls(&mut buf).unwrap();
            }
            let mut rd = &buf[..];
            while !rd.is_empty() {
                client.read_tls(&mut rd).unwrap();
                client.process_new_packets()?;
            }
        }
        Err(rustls::Error::General("handshake did not finish".to_string()))
    }

    fn connect(
        client: Arc<ClientConfig>,
        server: Arc<ServerConfig>,
    ) -> Result<ServerConnection, rustls::Error> {
        let mut c = ClientConnection::new(client, ServerName::try_from("localhost").unwrap())?;
        let mut s = ServerConnection::new(server)?;
        pump(&mut c, &mut s)?;
        Ok(s)
    }

    #[test]
    fn test_mutual_handshake() {
        let pki = pki();
        let device = pki
            .ca
            .issue_service_certificate(Role::Device, "central_simulada_01", 30)
            .unwrap();

        let server = build_server_config(&pki.anchor, &credentials(&pki.server)).unwrap();
        let client =
            build_client_config(&pki.anchor, &credentials(&device), "central_simulada_01").unwrap();
        assert_eq!(client.client_id(), "central_simulada_01");

        let conn = connect(client.config(), server).unwrap();
        let peer = conn.peer_certificates().unwrap();
        assert_eq!(peer[0].as_ref(), device.certificate.der.as_slice());
    }

    #[test]
    fn test_client_from_foreign_root_is_rejected() {
        let pki = pki();
        let other = self::pki();
        let intruder = other
            .ca
            .issue_service_certificate(Role::Device, "central_simulada_01", 30)
            .unwrap();

        let server = build_server_config(&pki.anchor, &credentials(&pki.server)).unwrap();
        // The intruder trusts the real root so it accepts the server
        let client = build_client_config(&pki.anchor, &credentials(&intruder), "x").unwrap();
        assert!(connect(client.config(), server).is_err());
    }

    #[test]
    fn test_server_from_foreign_root_is_rejected() {
        let pki = pki();
        let other = self::pki();
        let device = pki
            .ca
            .issue_service_certificate(Role::Device, "central_simulada_01", 30)
            .unwrap();

        let server = build_server_config(&pki.anchor, &credentials(&other.server)).unwrap();
        let client = build_client_config(&pki.anchor, &credentials(&device), "x").unwrap();
        assert!(connect(client.config(), server).is_err());
    }

    #[test]
    fn test_client_without_certificate_is_rejected() {
        let pki = pki();
        let server = build_server_config(&pki.anchor, &credentials(&pki.server)).unwrap();

        let anonymous = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(pki.anchor.root_store().unwrap())
            .with_no_client_auth();
        assert!(connect(Arc::new(anonymous), server).is_err());
    }

    #[test]
    fn test_credentials_require_both_halves() {
        let pki = pki();
        assert!(matches!(
            Credentials::from_pem(&pki.server.certificate.pem, ""),
            Err(PkiError::ConfigError(_))
        ));
        assert!(matches!(
            Credentials::from_pem("", &pki.server.private_key_pem),
            Err(PkiError::ConfigError(_))
        ));
        assert!(!format!("{:?}", credentials(&pki.server)).contains("PRIVATE"));
    }

    #[test]
    fn test_trust_anchor_requires_certificate() {
        assert!(TrustAnchor::from_pem("").is_err());
        let pki = pki();
        assert!(TrustAnchor::from_pem(&pki.server.private_key_pem).is_err());
    }

    #[test]
    fn test_load_from_store() {
        let pki = pki();
        let store = MemoryKeyStore::new();
        store.save("server", &pki.server.key_material()).unwrap();
        store
            .save_certificate("ca", pki.ca.certificate_pem())
            .unwrap();

        let anchor = TrustAnchor::from_store(&store, "ca").unwrap();
        let creds = Credentials::from_store(&store, "server").unwrap();
        assert_eq!(anchor.certificates().len(), 1);
        assert!(build_server_config(&anchor, &creds).is_ok());
        assert!(Credentials::from_store(&store, "backend").is_err());
    }

    #[test]
    fn test_backend_client_id() {
        let id = backend_client_id().unwrap();
        assert!(id.starts_with(BACKEND_CLIENT_PREFIX));
        let suffix = &id[BACKEND_CLIENT_PREFIX.len()..];
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
