#![no_main]
use libfuzzer_sys::fuzz_target;
use ippoc_gate::PeerKey;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(key) = PeerKey::parse(text) {
            assert_eq!(key.as_str(), text);
            let bytes = key.public_key_bytes().expect("parsed key is hex");
            assert_eq!(PeerKey::from_public_key(&bytes), key);
        }
    }
});
