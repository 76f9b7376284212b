//! Ready-made sinks for the two session loops: CSV logging and TCP
//! forwarding for RTP records, file dumping for elementary stream frames.
//!
//! Each sink is generic over [`std::io::Write`] so tests and tools can
//! point them at in-memory buffers, files, or sockets without caring
//! which.

use crate::ps::{ElementaryFrame, FrameSink, Validity};
use crate::rtp::{PacketFlow, PacketSink, RtpRecord};
use crate::ElementaryKind;
use std::io;
use std::thread;
use std::time::Duration;

/// A sink that discards everything, for sessions run only for their side
/// counters.
#[derive(Default)]
pub struct NullSink;
impl FrameSink for NullSink {
    fn frame(&mut self, _frame: &ElementaryFrame<'_>) -> io::Result<()> {
        Ok(())
    }
}
impl PacketSink for NullSink {
    fn packet(&mut self, _record: &RtpRecord, _raw: &[u8]) -> io::Result<PacketFlow> {
        Ok(PacketFlow::Continue)
    }
}

/// Writes the payload of each clean frame to a per-kind writer, producing
/// raw elementary streams.
///
/// Recovered frames are dropped: their payloads end at a resynchronization
/// point rather than a length boundary, and a decoder fed the dump should
/// not have to cope with that.
pub struct EsFileSink<W: io::Write> {
    video: Option<W>,
    audio: Option<W>,
}
impl<W: io::Write> EsFileSink<W> {
    /// Either writer may be `None` to drop that kind of frame.
    pub fn new(video: Option<W>, audio: Option<W>) -> EsFileSink<W> {
        EsFileSink { video, audio }
    }

    pub fn into_parts(self) -> (Option<W>, Option<W>) {
        (self.video, self.audio)
    }
}
impl<W: io::Write> FrameSink for EsFileSink<W> {
    fn frame(&mut self, frame: &ElementaryFrame<'_>) -> io::Result<()> {
        if frame.validity != Validity::Clean {
            return Ok(());
        }
        let writer = match frame.kind {
            ElementaryKind::Video => self.video.as_mut(),
            ElementaryKind::Audio => self.audio.as_mut(),
        };
        match writer {
            Some(w) => w.write_all(frame.data),
            None => Ok(()),
        }
    }
}

/// Logs one CSV row per accepted record, in capture order.
pub struct CsvPacketLog<W: io::Write> {
    out: W,
}
impl<W: io::Write> CsvPacketLog<W> {
    /// Writes the column header row and wraps `out`.
    pub fn new(mut out: W) -> io::Result<CsvPacketLog<W>> {
        writeln!(out, "P, X, CC, M, PT, SeqNum, timestamp, SSRC, RTPLen")?;
        Ok(CsvPacketLog { out })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
impl<W: io::Write> PacketSink for CsvPacketLog<W> {
    fn packet(&mut self, record: &RtpRecord, _raw: &[u8]) -> io::Result<PacketFlow> {
        writeln!(
            self.out,
            "{}, {}, {}, {}, {}, {}, {}, {}, {}",
            record.padding as u8,
            record.extension as u8,
            record.csrc.len(),
            record.marker as u8,
            record.payload_type,
            record.sequence_number,
            record.timestamp,
            record.ssrc,
            record.record_length,
        )?;
        Ok(PacketFlow::Continue)
    }
}

/// Re-sends each accepted record verbatim, length prefix included, so the
/// receiver can parse the stream with the same record framing.
///
/// Sends are paced with a fixed delay so a live receiver is not flooded by
/// a capture that arrives all at once, and the session is completed after
/// `limit` records.
pub struct Forwarder<W: io::Write> {
    out: W,
    pacing: Duration,
    remaining: u64,
}
impl<W: io::Write> Forwarder<W> {
    pub fn new(out: W, limit: u64) -> Forwarder<W> {
        Forwarder {
            out,
            pacing: Duration::from_millis(5),
            remaining: limit,
        }
    }

    pub fn set_pacing(&mut self, pacing: Duration) {
        self.pacing = pacing;
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
impl<W: io::Write> PacketSink for Forwarder<W> {
    fn packet(&mut self, _record: &RtpRecord, raw: &[u8]) -> io::Result<PacketFlow> {
        if self.remaining == 0 {
            return Ok(PacketFlow::Complete);
        }
        self.out.write_all(raw)?;
        self.remaining -= 1;
        if self.remaining == 0 {
            return Ok(PacketFlow::Complete);
        }
        thread::sleep(self.pacing);
        Ok(PacketFlow::Continue)
    }
}
