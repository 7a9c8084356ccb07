#![no_main]

use bytes::BytesMut;
use grpc::{HEADER_SIZE, MessageDecoder, encode_message};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = MessageDecoder::new(64 * 1024);
    let chunk_size = (data.len() / 3).max(1);

    for chunk in data.chunks(chunk_size) {
        decoder.feed(chunk);
        loop {
            match decoder.next_message() {
                Ok(Some(message)) => {
                    // Anything decoded must survive a second trip.
                    let mut framed = BytesMut::new();
                    encode_message(&message, &mut framed);
                    assert_eq!(framed.len(), HEADER_SIZE + message.len());
                    let mut again = MessageDecoder::new(64 * 1024);
                    again.feed(&framed);
                    assert_eq!(again.next_message().ok().flatten(), Some(message));
                    assert!(again.finish().is_ok());
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
    assert_eq!(decoder.finish().is_ok(), decoder.buffered_len() == 0);
});
