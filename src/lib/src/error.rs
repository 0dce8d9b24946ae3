/// The meterpki error type.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("Device {0} is not registered")]
    UnknownDevice(String),

    #[error("Malformed certificate request: {0}")]
    MalformedRequest(String),

    #[error("Malformed public key: {0}")]
    MalformedPublicKey(String),

    #[error("Certificate request signature does not verify")]
    InvalidRequestSignature,

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("I/O error")]
    IOError(#[from] std::io::Error),

    #[error("No key material stored under [{0}]")]
    NotFound(String),

    #[error("Key material under [{0}] is incomplete")]
    IncompleteKeyMaterial(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("X509 error")]
    X509Error(x509_parser::nom::Err<x509_parser::error::X509Error>),

    #[error("Usage error: {0}")]
    UsageError(&'static str),
}

impl PkiError {
    /// Stable short tag for audit records and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            PkiError::UnknownDevice(_) => "unknown_device",
            PkiError::MalformedRequest(_) => "malformed_request",
            PkiError::MalformedPublicKey(_) => "malformed_public_key",
            PkiError::InvalidRequestSignature => "invalid_request_signature",
            PkiError::SigningError(_) => "signing_error",
            PkiError::IOError(_) => "io_error",
            PkiError::NotFound(_) => "not_found",
            PkiError::IncompleteKeyMaterial(_) => "incomplete_key_material",
            PkiError::CertificateError(_) => "certificate_error",
            PkiError::TlsError(_) => "tls_error",
            PkiError::ConfigError(_) => "config_error",
            PkiError::InvalidArgument(_) => "invalid_argument",
            PkiError::HttpError(_) => "http_error",
            PkiError::InternalError(_) => "internal_error",
            PkiError::X509Error(_) => "x509_error",
            PkiError::UsageError(_) => "usage_error",
        }
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for PkiError {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        PkiError::X509Error(err)
    }
}

impl From<x509_parser::error::X509Error> for PkiError {
    fn from(err: x509_parser::error::X509Error) -> Self {
        PkiError::CertificateError(err.to_string())
    }
}

impl From<rcgen::Error> for PkiError {
    fn from(err: rcgen::Error) -> Self {
        PkiError::SigningError(err.to_string())
    }
}

impl From<rustls::Error> for PkiError {
    fn from(err: rustls::Error) -> Self {
        PkiError::TlsError(err.to_string())
    }
}

impl From<pem::PemError> for PkiError {
    fn from(err: pem::PemError) -> Self {
        PkiError::CertificateError(format!("invalid PEM: {}", err))
    }
}

impl From<serde_json::Error> for PkiError {
    fn from(err: serde_json::Error) -> Self {
        PkiError::MalformedRequest(err.to_string())
    }
}

impl From<toml::de::Error> for PkiError {
    fn from(err: toml::de::Error) -> Self {
        PkiError::ConfigError(err.to_string())
    }
}

impl From<base64::DecodeError> for PkiError {
    fn from(err: base64::DecodeError) -> Self {
        PkiError::ConfigError(format!("invalid base64: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for PkiError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        PkiError::InternalError(format!("invalid UTF-8: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PkiError::UnknownDevice("ghost-01".to_string());
        assert_eq!(err.to_string(), "Device ghost-01 is not registered");

        let err = PkiError::InvalidRequestSignature;
        assert_eq!(
            err.to_string(),
            "Certificate request signature does not verify"
        );

        let err = PkiError::NotFound("ca".to_string());
        assert_eq!(err.to_string(), "No key material stored under [ca]");

        let err = PkiError::IncompleteKeyMaterial("backend".to_string());
        assert_eq!(err.to_string(), "Key material under [backend] is incomplete");
    }

    #[test]
    fn test_error_with_params() {
        let err = PkiError::InternalError("test error".to_string());
        assert_eq!(err.to_string(), "Internal error: [test error]");

        let err = PkiError::MalformedPublicKey("RSA key too short".to_string());
        assert_eq!(err.to_string(), "Malformed public key: RSA key too short");

        let err = PkiError::UsageError("invalid usage");
        assert_eq!(err.to_string(), "Usage error: invalid usage");
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(PkiError::UnknownDevice("x".into()).kind(), "unknown_device");
        assert_eq!(
            PkiError::InvalidRequestSignature.kind(),
            "invalid_request_signature"
        );
        assert_eq!(
            PkiError::MalformedRequest("x".into()).kind(),
            "malformed_request"
        );
        assert_eq!(PkiError::SigningError("x".into()).kind(), "signing_error");
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PkiError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert_eq!(err.kind(), "io_error");
    }

    #[test]
    fn test_error_from_base64() {
        use base64::Engine;
        let decode_err = base64::engine::general_purpose::STANDARD
            .decode("not base64!")
            .unwrap_err();
        let err: PkiError = decode_err.into();
        assert!(matches!(err, PkiError::ConfigError(_)));
    }

    #[test]
    fn test_error_debug() {
        let err = PkiError::InvalidRequestSignature;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("InvalidRequestSignature"));
    }
}
