#![no_main]

use compat_source::entities;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    if let Ok(list) = entities::parse_entities(&text) {
        for entity in &list {
            let _ = entity.origin();
        }
    }
});
