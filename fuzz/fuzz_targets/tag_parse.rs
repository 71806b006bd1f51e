//! Fuzz harness for `Tag::parse`.
//!
//! Parsed tags must round-trip through their canonical text form.

#![no_main]
use corral_core::Tag;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(tag) = Tag::parse(text) {
        let reparsed = Tag::parse(tag.as_str()).expect("canonical form parses");
        assert_eq!(reparsed, tag);
        assert_eq!(reparsed.kind(), tag.kind());
    }
});
