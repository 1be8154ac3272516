#![no_main]

use libfuzzer_sys::fuzz_target;
use shipwright::types::Artifact;

fuzz_target!(|data: &[u8]| {
    if let Ok(artifact) = serde_json::from_slice::<Artifact>(data) {
        // A successfully parsed artifact must reserialize.
        let _ = serde_json::to_string(&artifact);
    }
});
