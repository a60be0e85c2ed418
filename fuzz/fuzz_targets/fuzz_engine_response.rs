#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use confidential_tx_relay::engine::wire;
use confidential_tx_relay::frame::Frame;

fuzz_target!(|data: &[u8]| {
    // Responses come from a separate process; decoding them must never panic.
    let frame = Frame::response(7, Bytes::copy_from_slice(data));
    let _ = wire::decode_response(7, &frame);
});
