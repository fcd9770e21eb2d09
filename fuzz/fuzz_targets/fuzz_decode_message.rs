#![no_main]

use bytes::{Buf, BytesMut};
use libfuzzer_sys::fuzz_target;
use pgbackup_connect::protocol::decode::decode_message;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Several messages may arrive in one TCP segment
    while !buf.is_empty() {
        match decode_message(&buf) {
            Ok(Some((_, consumed))) => {
                assert!(consumed > 0 && consumed <= buf.len());
                buf.advance(consumed);
            }
            Ok(None) | Err(_) => break,
        }
    }
});
