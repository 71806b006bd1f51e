//! Fuzz harness for request frame decoding.
//!
//! Arbitrary frames must either decode into a [`Request`] that re-encodes
//! to a decodable frame with the same routing fields, or fail with an
//! error. The request-id salvage used for error replies must never panic.

#![no_main]
use corral_apiserver::protocol::Request;
use corral_apiserver::protocol::messages::salvage_request_id;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = salvage_request_id(data);
    if let Ok(request) = Request::decode(data) {
        let encoded = request.encode().expect("decoded request re-encodes");
        let again = Request::decode(&encoded).expect("encoded request decodes");
        assert_eq!(again.request_id, request.request_id);
        assert_eq!(again.facade, request.facade);
        assert_eq!(again.method, request.method);
    }
});
