//! Fuzz target for certificate request parsing
//!
//! Requests arrive from devices that have not authenticated yet, so every
//! byte is attacker-controlled:
//! - Malformed PEM armor and tags
//! - Truncated or over-long DER structures
//! - Unusual public key encodings and curve parameters
//! - Signatures that do not match the enclosed key

#![no_main]

use libfuzzer_sys::fuzz_target;
use meterpki::provisioning::CertificateRequest;

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = CertificateRequest::from_der(data.to_vec()) {
        let _ = request.claimed_subject_name();
        let _ = request.check_public_key();
        let _ = request.verify_signature();

        // A request that parsed once must parse again from its PEM form
        let pem = request.to_pem();
        assert!(CertificateRequest::from_pem(&pem).is_ok());
    }

    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(request) = CertificateRequest::from_pem(s) {
            let _ = request.check_public_key();
            let _ = request.verify_signature();
        }
    }
});
