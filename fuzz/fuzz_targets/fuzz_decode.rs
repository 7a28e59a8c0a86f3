#![no_main]

use bytes::BytesMut;
use devtools_transport::core::codec::{Frame, PacketCodec};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Feed the input in two pieces to exercise resumable parsing
    let split = data.first().map_or(0, |b| *b as usize % (data.len() + 1));
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    for piece in [&data[..split], &data[split..]] {
        buf.extend_from_slice(piece);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(Frame::Bulk(header))) => {
                    let skip = usize::try_from(header.length).unwrap_or(usize::MAX).min(buf.len());
                    let _ = buf.split_to(skip);
                }
                Ok(Some(Frame::Json(_))) => {}
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
    let _ = codec.decode_eof(&mut buf);
});
