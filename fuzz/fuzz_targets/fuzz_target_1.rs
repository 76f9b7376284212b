#![no_main]

use libfuzzer_sys::fuzz_target;
use mpegps_reader::ps;
use mpegps_reader::rtp;
use mpegps_reader::sink::NullSink;

fuzz_target!(|data: &[u8]| {
    // treat the input as a capture: record pass, then the reconstruction
    let mut session = rtp::RtpDecoder::new(data);
    let _ = session.run(&mut NullSink);
    let stream = session.into_payload();
    let mut state = ps::PsSessionState::new();
    let _ = ps::PsDecoder::new(&stream).run(&mut state, &mut NullSink);

    // treat the input as a raw Program Stream
    let mut state = ps::PsSessionState::new();
    let _ = ps::PsDecoder::new(data).run(&mut state, &mut NullSink);
});
