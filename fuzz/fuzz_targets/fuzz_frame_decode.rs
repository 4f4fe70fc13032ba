#![no_main]

use libfuzzer_sys::fuzz_target;
use medley::transport::decode_frame;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes off the wire must never panic the decoder, and any
    // frame that decodes must serialize back out.
    if let Ok(frame) = decode_frame(data) {
        serde_json::to_vec(&frame).expect("decoded frame must re-encode");
    }
});
