#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

use confidential_tx_relay::frame::codec::FrameCodec;
use confidential_tx_relay::frame::{batch, FrameType};

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the frame decoder; errors are fine, panics are not.
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(data);

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => match frame.header.msg_type {
                FrameType::Transactions | FrameType::StreamBatch => {
                    let _ = batch::decode(frame.payload);
                }
                FrameType::Disconnect => {
                    let _ = frame.disconnect_reason();
                }
                _ => {}
            },
            Ok(None) => break,
            Err(_) => break,
        }
    }
});
