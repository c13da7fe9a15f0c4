#![no_main]

use berth_client::{Headers, ParsedResponse, ResponseDecoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any UTF-8 body must classify into a message or an error signal.
    if let Ok(body) = std::str::from_utf8(data) {
        let _ = ResponseDecoder::new().classify(ParsedResponse {
            status_code: 200,
            headers: Headers::new(),
            body: body.to_string(),
        });
    }
});
