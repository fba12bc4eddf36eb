#![no_main]

use libfuzzer_sys::fuzz_target;
use keyward_core::{Redactor, REDACTED};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    // First byte picks the secret length, the rest is the secret then the text
    let split = 1 + (data[0] as usize % 16).min(data.len() - 1);
    let (secret, text) = data[1..].split_at(split - 1);
    let Ok(secret) = std::str::from_utf8(secret) else {
        return;
    };
    let text = String::from_utf8_lossy(text);

    let redactor = Redactor::new();
    let guard = redactor.register(secret);
    let out = redactor.redact(&text);
    let changed = *out != *text;
    assert_eq!(changed, !secret.is_empty() && text.contains(secret) && secret != REDACTED);

    drop(guard);
    assert!(redactor.is_empty());
    let _ = redactor.redact_bytes(text.as_bytes());
});
