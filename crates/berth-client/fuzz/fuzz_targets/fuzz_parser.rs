#![no_main]

use berth_client::{ParserEvent, ResponseParser};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First byte picks the fragment size so split points vary too.
    // Feeding must never panic, only emit units or return Err.
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let fragment = usize::from(split).max(1);

    let mut parser = ResponseParser::new();
    for piece in rest.chunks(fragment) {
        let _ = parser.feed_events(piece, |event| {
            if let ParserEvent::Response(response) = event {
                let _ = response.is_chunk();
            }
        });
    }
    parser.reset();
});
