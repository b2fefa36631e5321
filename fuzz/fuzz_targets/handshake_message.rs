#![no_main]
use libfuzzer_sys::fuzz_target;
use ippoc_gate::HandshakeMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = HandshakeMessage::from_bytes(data) {
        let encoded = message.to_bytes().expect("decoded message re-encodes");
        assert_eq!(HandshakeMessage::from_bytes(&encoded).ok(), Some(message));
    }
});
