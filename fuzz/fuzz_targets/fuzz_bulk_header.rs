#![no_main]

use bytes::BytesMut;
use devtools_transport::core::codec::PacketCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Headers always start with the keyword so the bulk parser is reached
    let mut buf = BytesMut::from(&b"bulk "[..]);
    buf.extend_from_slice(data);
    let _ = PacketCodec::default().decode(&mut buf);
});
