//! Fuzz target for the provisioning request body
//!
//! Drives the full service path: JSON decoding, registry lookup, CSR
//! parsing and the signing checks. Whatever the input, the service must
//! answer with a result and never with a response for an unregistered
//! serial.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meterpki::provisioning::{
    CaConfig, CertificateAuthority, MemoryDeviceRegistry, ProvisioningService,
};
use std::sync::{Arc, OnceLock};

fn service() -> &'static ProvisioningService {
    static SERVICE: OnceLock<ProvisioningService> = OnceLock::new();
    SERVICE.get_or_init(|| {
        let (ca, _) = CertificateAuthority::create_root(&CaConfig::default())
            .expect("root generation");
        let registry = MemoryDeviceRegistry::with_serials(["central_simulada_01"])
            .expect("registry");
        ProvisioningService::new(Arc::new(ca), Arc::new(registry))
    })
}

fuzz_target!(|data: &[u8]| {
    let serial = serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get("serialNumber").and_then(|s| s.as_str()).map(str::to_string));

    if service().provision_json(data).is_ok() {
        assert_eq!(serial.as_deref(), Some("central_simulada_01"));
    }
});
