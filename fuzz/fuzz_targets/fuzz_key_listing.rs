#![no_main]

use libfuzzer_sys::fuzz_target;
use keyward_core::KeyIdentity;

fuzz_target!(|data: &[u8]| {
    let Ok(listing) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(identity) = KeyIdentity::from_colon_listing(listing) {
        // Every subkey lookup resolves, grips or not
        assert_eq!(identity.subkeys().count(), 3);
        let _ = identity.subkey_keygrips();
    }
});
