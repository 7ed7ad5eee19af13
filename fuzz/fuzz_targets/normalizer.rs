#![no_main]

use libfuzzer_sys::fuzz_target;
use m2m_decode::config::NormalizerConfig;
use m2m_decode::normalizer::Normalizer;
use m2m_decode::stream::Packet;
use m2m_decode::stream::StreamDescriptor;
use m2m_decode::EncodedFormat;
use m2m_decode::Rational;
use m2m_decode::Resolution;

fuzz_target!(|data: &[u8]| {
    // The first bytes act as the configuration record, the rest as length-prefixed packets.
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (extradata, payload) = data.split_at(split);

    let mut stream = StreamDescriptor::new(
        EncodedFormat::H264,
        Resolution::from((320, 240)),
        Rational::new(1, 90_000),
    );
    stream.extradata = extradata.to_vec();

    let mut normalizer = Normalizer::new(&stream, &NormalizerConfig::default());
    for chunk in payload.chunks(97) {
        let _ = normalizer.normalize(Packet::new(chunk.to_vec()));
    }
    let _ = normalizer.finish();
});
