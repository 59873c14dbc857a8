//! Fuzz target for protocol parsing and console input scanning.
//!
//! Arbitrary bytes must never panic when parsed as Request/Response or fed
//! through the detach sequence detector.

#![no_main]

use congo::attach::{ESCAPE_SEQUENCE, EscapeDetector};
use congo::protocol::{Request, Response};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Request>(data);
    let _ = serde_json::from_slice::<Response>(data);

    // Keyboard input arrives in arbitrary pieces; the detach sequence itself
    // must never reach the console.
    let mut detector = EscapeDetector::new();
    for piece in data.chunks(3) {
        let feed = detector.feed(piece);
        assert!(
            !feed
                .forward
                .windows(ESCAPE_SEQUENCE.len())
                .any(|w| w == ESCAPE_SEQUENCE)
        );
        if feed.detach {
            break;
        }
    }
});
