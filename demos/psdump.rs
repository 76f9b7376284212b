//! Reconstructs the Program Stream from an RTP capture named on the
//! command line and demultiplexes it, describing each frame on stdout and
//! dumping clean payloads to `video.es` / `audio.es`.  The first clean
//! keyframe's leading access unit is additionally written to
//! `keyframe.264`, which a stock H.264 decoder can turn into a still.
//!
//! An optional second argument caps how many video frames are dumped
//! before the session ends with `DumpComplete`.

use hex_slice::AsHex;
use mpegps_reader::nal;
use mpegps_reader::ps;
use mpegps_reader::rtp;
use mpegps_reader::sink;
use mpegps_reader::ElementaryKind;
use std::cmp;
use std::env;
use std::fs::File;
use std::io;
use std::io::Read;

struct DescribingSink<W: io::Write> {
    files: sink::EsFileSink<W>,
    keyframe_written: bool,
}
impl<W: io::Write> ps::FrameSink for DescribingSink<W> {
    fn frame(&mut self, frame: &ps::ElementaryFrame<'_>) -> io::Result<()> {
        println!(
            "{:?} {:?} frame, {} bytes, starting {:02x}",
            frame.validity,
            frame.kind,
            frame.data.len(),
            frame.data[..cmp::min(frame.data.len(), 16)].plain_hex(false)
        );
        if !self.keyframe_written
            && frame.kind == ElementaryKind::Video
            && frame.validity == ps::Validity::Clean
            && matches!(
                nal::classify(frame.data),
                Some(nal::UnitType::Sps) | Some(nal::UnitType::Idr)
            )
        {
            std::fs::write("keyframe.264", nal::first_access_unit(frame.data))?;
            self.keyframe_written = true;
        }
        self.files.frame(frame)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let name = env::args().nth(1).expect("usage: psdump <capture> [frame-cap]");
    let mut f = File::open(&name).unwrap_or_else(|_| panic!("file not found: {}", &name));
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).expect("read failed");

    // first pass: strip the capture framing
    let mut session = rtp::RtpDecoder::new(&buf[..]);
    if let Err(e) = session.run(&mut sink::NullSink) {
        eprintln!("capture unusable: {:?}", e);
    }
    eprintln!("{}", session.state());
    let stream = session.into_payload();

    // second pass: demultiplex the reconstructed Program Stream
    let video = File::create("video.es").expect("creating video.es failed");
    let audio = File::create("audio.es").expect("creating audio.es failed");
    let mut frames = DescribingSink {
        files: sink::EsFileSink::new(Some(video), Some(audio)),
        keyframe_written: false,
    };
    let mut state = ps::PsSessionState::new();
    let mut decoder = ps::PsDecoder::new(&stream);
    if let Some(cap) = env::args().nth(2) {
        decoder.set_video_frame_cap(Some(cap.parse().expect("frame cap must be a number")));
    }
    match decoder.run(&mut state, &mut frames) {
        Ok(end) => eprintln!("session ended: {:?}", end),
        Err(e) => eprintln!("demultiplexing failed: {:?}", e),
    }
    if let Some(t) = state.video_stream_type() {
        eprintln!("video stream type {:#04x} ({:?})", u8::from(t), t);
    }
    if let Some(t) = state.audio_stream_type() {
        eprintln!("audio stream type {:#04x} ({:?})", u8::from(t), t);
    }
    eprintln!("{}", state.stats());
}
