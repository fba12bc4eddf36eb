#![no_main]

use libfuzzer_sys::fuzz_target;
use keyward_core::Device;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(device) = Device::from_card_status(raw) {
        // A parsed report always carries a serial
        assert!(raw.contains(device.serial.as_str()));

        // Occupancy flags must agree with each other
        if device.slots.all_occupied() {
            assert!(!device.slots.all_empty());
        }
        for (_, state) in device.slots.iter() {
            if state.fingerprint().is_some() {
                assert!(state.is_occupied());
            }
        }

        let _ = device.summary();
    }
});
