#![no_main]

use libfuzzer_sys::fuzz_target;
use m2m_decode::assembler::Assembler;
use m2m_decode::stream::Packet;
use m2m_decode::EncodedFormat;

fuzz_target!(|data: &[u8]| {
    let codec = if data.first().map_or(false, |b| b & 1 == 1) {
        EncodedFormat::H265
    } else {
        EncodedFormat::H264
    };
    let mut assembler = Assembler::new(codec, 1 << 20);

    for chunk in data.chunks(61) {
        if assembler.parse(Packet::new(chunk.to_vec())).is_err() {
            assembler.reset();
        }
    }
    let _ = assembler.flush();
});
