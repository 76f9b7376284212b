//! Structures for parsing MPEG Program Stream data, per the _ISO/IEC
//! 13818-1_ standard, including the length-prefixed RTP capture framing
//! such streams are sometimes recorded inside.
//!
//! # Design principles
//!
//!  * *Avoid copying and allocating* if possible.  Most of the
//!    implementation works by borrowing slices of the underlying byte
//!    buffer; demultiplexed frames borrow from the session buffer rather
//!    than copying out of it.
//!  * *Survive damage*.  Captures of real transmissions contain corrupt
//!    packets and lying length fields.  Per-record and per-frame problems
//!    are counted, logged and stepped over; only structural failures, where
//!    no further parse position can be trusted, end a session.
//!  * *Transport neutral*.  The APIs accept `&[u8]`, and the caller handles
//!    providing the data from wherever.  (The RTP payload reconstruction is
//!    the one place bytes accumulate, since the second parsing pass needs a
//!    contiguous view of the Program Stream.)
//!
//! # Using this crate
//!
//! A capture is parsed in two passes.  The first walks the RTP records,
//! checks each against the stream identity, and reconstructs the contiguous
//! Program Stream from their payloads; the second demultiplexes that stream
//! into elementary stream frames:
//!
//! ```
//! use mpegps_reader::{ps, rtp, sink};
//!
//! fn dump(capture: &[u8]) -> Result<(), ps::PsError> {
//!     let mut session = rtp::RtpDecoder::new(capture);
//!     if let Err(e) = session.run(&mut sink::NullSink) {
//!         eprintln!("capture unusable: {:?}", e);
//!     }
//!     let stream = session.into_payload();
//!     let mut state = ps::PsSessionState::new();
//!     ps::PsDecoder::new(&stream).run(&mut state, &mut sink::NullSink)?;
//!     println!("{}", state.stats());
//!     Ok(())
//! }
//! # dump(&[]).unwrap();
//! ```

#![forbid(unsafe_code)]

pub mod bitreader;
pub mod nal;
pub mod ps;
pub mod rtp;
pub mod sink;

/// The subset of _ISO/IEC 13818-1_ stream type values a Program Stream Map
/// is expected to name, with `Private`/`Reserved` catch-alls for the rest.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum StreamType {
    // 0x00 reserved
    Iso11172Video,
    H262,
    Iso11172Audio,
    Iso138183Audio,
    Adts,
    Iso144962Visual,
    Latm,
    H264,
    H265,
    /// `0x80..=0xff`, privately defined
    Private(u8),
    /// anything else
    Reserved(u8),
}
impl From<u8> for StreamType {
    fn from(val: u8) -> Self {
        match val {
            0x01 => StreamType::Iso11172Video,
            0x02 => StreamType::H262,
            0x03 => StreamType::Iso11172Audio,
            0x04 => StreamType::Iso138183Audio,
            0x0f => StreamType::Adts,
            0x10 => StreamType::Iso144962Visual,
            0x11 => StreamType::Latm,
            0x1b => StreamType::H264,
            0x24 => StreamType::H265,
            _ => {
                if val >= 0x80 {
                    StreamType::Private(val)
                } else {
                    StreamType::Reserved(val)
                }
            }
        }
    }
}
impl From<StreamType> for u8 {
    fn from(val: StreamType) -> Self {
        match val {
            StreamType::Iso11172Video => 0x01,
            StreamType::H262 => 0x02,
            StreamType::Iso11172Audio => 0x03,
            StreamType::Iso138183Audio => 0x04,
            StreamType::Adts => 0x0f,
            StreamType::Iso144962Visual => 0x10,
            StreamType::Latm => 0x11,
            StreamType::H264 => 0x1b,
            StreamType::H265 => 0x24,
            StreamType::Private(val) => val,
            StreamType::Reserved(val) => val,
        }
    }
}

/// Which of the two tracked elementary streams a PES packet belongs to,
/// per its start code.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ElementaryKind {
    /// stream ids `0xe0..=0xef`
    Video,
    /// stream ids `0xc0..=0xdf`
    Audio,
}

/// How a session loop came to a normal stop.  Each of these is a success:
/// errors that end a session are reported through the loop's error type
/// instead.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionEnd {
    /// the input buffer was fully consumed
    EndOfStream,
    /// the configured video frame cap was reached
    DumpComplete,
    /// a sink reported that it had received all the records it wanted
    ForwardComplete,
}
