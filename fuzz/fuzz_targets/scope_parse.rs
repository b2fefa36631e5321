#![no_main]
use libfuzzer_sys::fuzz_target;
use ippoc_gate::CapabilityScope;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(scope) = text.parse::<CapabilityScope>() {
            assert_eq!(scope.to_string().parse::<CapabilityScope>().ok(), Some(scope));
        }
    }
});
