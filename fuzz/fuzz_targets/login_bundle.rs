//! Fuzz harness for login parameters.
//!
//! Arbitrary JSON is decoded as `Admin.Login` parameters and, when it
//! decodes, converted to a credential and checked against a bakery. No
//! input may panic, and no bundle the fuzzer can build verifies under a
//! root key it never saw.

#![no_main]
use chrono::Utc;
use corral_apiserver::protocol::admin::LoginRequest;
use corral_core::credentials::{Bakery, Credential};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(request) = serde_json::from_slice::<LoginRequest>(data) else {
        return;
    };
    let Ok((credential, _model)) = request.into_credential() else {
        return;
    };
    if let Credential::Macaroons(bundle) = credential {
        let bakery = Bakery::new([1u8; 32], "corral", "https://identity", [2u8; 32]);
        assert!(bakery.check(&bundle, Utc::now()).is_err());
    }
});
