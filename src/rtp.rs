//! Parsing for the RTP capture format that carries a Program Stream.
//!
//! The capture is not standard RTP-over-UDP framing: each record starts with
//! a 16-bit length prefix covering the RTP header plus payload, and only
//! then the usual 12-byte header and CSRC list.  The length prefix is
//! trusted for record alignment even when a record is rejected, which is
//! what lets the session step over packets it will not decode.
//!
//! Payload bytes are collected into a reconstructed Program Stream buffer
//! for a second parsing pass by [`crate::ps::PsDecoder`].  Collection is
//! gated: everything before the first payload carrying a `00 00 01 BB`
//! system-header start code is discarded, since payload sampled mid-GOP
//! before that point cannot be decoded anyway.

use crate::bitreader::{BitReader, InsufficientData};
use crate::{ElementaryKind, SessionEnd};
use log::{debug, warn};
use std::fmt;
use std::io;

/// Errors which may terminate an RTP decode session.
#[derive(Debug)]
pub enum RtpError {
    /// The buffer ended inside a record's length prefix or header
    TruncatedHeader {
        /// name of the header field being read
        field: &'static str,
        /// number of bits the field needed
        requested: usize,
        /// number of bits the buffer still held
        available: usize,
    },
    /// A record's declared length is smaller than the header actually
    /// parsed, so the record cannot contain a payload at all
    LengthUnderflow {
        /// the length the capture framing declared
        declared: u16,
        /// bytes of header actually consumed
        header: usize,
    },
    /// A record's payload ran past the end of the buffer
    UnexpectedEndOfStream {
        /// byte offset at which the payload began
        position: usize,
    },
    /// A sink refused the data
    Io(io::Error),
}
impl From<io::Error> for RtpError {
    fn from(e: io::Error) -> RtpError {
        RtpError::Io(e)
    }
}

fn truncated(field: &'static str) -> impl FnOnce(InsufficientData) -> RtpError {
    move |e| RtpError::TruncatedHeader {
        field,
        requested: e.requested,
        available: e.available,
    }
}

/// One record from the capture: the decoded RTP header fields plus the
/// capture framing around them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpRecord {
    /// byte offset of the record's length prefix within the capture
    pub position: usize,
    /// record length declared by the capture framing (header plus payload,
    /// excluding the prefix itself)
    pub record_length: u16,
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    header_length: usize,
}
impl RtpRecord {
    /// bytes of header actually consumed: 12, plus 4 per CSRC entry
    pub fn header_length(&self) -> usize {
        self.header_length
    }

    /// The payload length implied by the capture framing, or
    /// [`RtpError::LengthUnderflow`] when the declared record length cannot
    /// even cover the header.
    pub fn payload_length(&self) -> Result<usize, RtpError> {
        usize::from(self.record_length)
            .checked_sub(self.header_length)
            .ok_or(RtpError::LengthUnderflow {
                declared: self.record_length,
                header: self.header_length,
            })
    }
}

/// Why [`RtpDecoder::validate()`] refused a record.  All of these are
/// per-record conditions; the session steps over the record and continues.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RejectReason {
    /// the padding flag is set, which this capture profile does not use
    Padding,
    /// the header-extension flag is set, likewise unsupported
    Extension,
    /// SSRC differs from the one pinned by the session's first record
    ForeignSsrc { expected: u32, actual: u32 },
    /// payload type differs from the pinned one
    ForeignPayloadType { expected: u8, actual: u8 },
}

/// Identity and progress of the RTP stream, persisting across one session
/// and never reset.
#[derive(Debug, Default)]
pub struct RtpStreamState {
    ssrc: Option<u32>,
    payload_type: Option<u8>,
    first_sequence: Option<u16>,
    last_sequence: Option<u16>,
    packet_count: u64,
    rejected_count: u64,
    discontinuities: u64,
    key_seen: bool,
    last_key_unit_position: Option<usize>,
}
impl RtpStreamState {
    /// the synchronization source pinned by the first acceptable record
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }
    /// the payload type pinned by the first acceptable record
    pub fn payload_type(&self) -> Option<u8> {
        self.payload_type
    }
    /// sequence number of the first accepted record
    pub fn first_sequence(&self) -> Option<u16> {
        self.first_sequence
    }
    /// sequence number of the most recently accepted record
    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }
    /// records accepted
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }
    /// records rejected by validation
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count
    }
    /// accepted records whose sequence number did not follow the previous one
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }
    /// true once a payload carrying the `00 00 01 BB` system-header code has
    /// been seen
    pub fn key_seen(&self) -> bool {
        self.key_seen
    }
    /// capture offset of the most recent system-header start code observed
    /// inside an accepted payload
    pub fn last_key_unit_position(&self) -> Option<usize> {
        self.last_key_unit_position
    }
}
impl fmt::Display for RtpStreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ssrc, self.payload_type) {
            (Some(ssrc), Some(pt)) => write!(f, "ssrc {:#010x} payload type {}", ssrc, pt)?,
            _ => write!(f, "no stream established")?,
        }
        write!(
            f,
            ", {} packets accepted ({} rejected, {} discontinuities)",
            self.packet_count, self.rejected_count, self.discontinuities
        )?;
        if let (Some(first), Some(last)) = (self.first_sequence, self.last_sequence) {
            write!(f, ", sequence {}..={}", first, last)?;
        }
        Ok(())
    }
}

/// Whether the session should continue after a sink accepts a record.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PacketFlow {
    Continue,
    /// the sink has all the records it wants (e.g. a forwarding cap was
    /// reached); end the session normally
    Complete,
}

/// Receives every accepted record: its decoded fields plus the verbatim
/// record bytes, length prefix included.
pub trait PacketSink {
    fn packet(&mut self, record: &RtpRecord, raw: &[u8]) -> io::Result<PacketFlow>;
}

/// Where a byte pattern was found by [`RtpDecoder::scan_for()`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SearchHit {
    /// capture offset of the match
    pub position: usize,
    /// sequence number of the record whose payload contains the match
    pub sequence_number: u16,
    /// the kind of PES start code, if any, that record's payload carries
    pub kind: Option<ElementaryKind>,
}

/// Decoder for a buffer of length-prefixed RTP capture records.
pub struct RtpDecoder<'buf> {
    reader: BitReader<'buf>,
    buf: &'buf [u8],
    state: RtpStreamState,
    payload: Vec<u8>,
}
impl<'buf> RtpDecoder<'buf> {
    pub fn new(buf: &'buf [u8]) -> RtpDecoder<'buf> {
        RtpDecoder {
            reader: BitReader::new(buf),
            buf,
            state: RtpStreamState::default(),
            payload: Vec::new(),
        }
    }

    pub fn state(&self) -> &RtpStreamState {
        &self.state
    }

    /// The reconstructed Program Stream bytes collected so far.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the decoder, yielding the reconstructed Program Stream for
    /// the second parsing pass.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Decodes the record at the cursor: length prefix, fixed header fields,
    /// then the CSRC list.  The cursor is left at the start of the payload.
    pub fn decode_next(&mut self) -> Result<RtpRecord, RtpError> {
        let position = self.reader.byte_position();
        let record_length = self.reader.read(16).map_err(truncated("record_length"))? as u16;
        let header_start = self.reader.position();
        let version = self.reader.read(2).map_err(truncated("version"))? as u8;
        let padding = self.reader.read(1).map_err(truncated("padding"))? != 0;
        let extension = self.reader.read(1).map_err(truncated("extension"))? != 0;
        let csrc_count = self.reader.read(4).map_err(truncated("csrc_count"))? as u8;
        let marker = self.reader.read(1).map_err(truncated("marker"))? != 0;
        let payload_type = self.reader.read(7).map_err(truncated("payload_type"))? as u8;
        let sequence_number =
            self.reader.read(16).map_err(truncated("sequence_number"))? as u16;
        let timestamp = self.reader.read(32).map_err(truncated("timestamp"))?;
        let ssrc = self.reader.read(32).map_err(truncated("ssrc"))?;
        let mut csrc = Vec::with_capacity(usize::from(csrc_count));
        for _ in 0..csrc_count {
            csrc.push(self.reader.read(32).map_err(truncated("csrc"))?);
        }
        let header_length = (self.reader.position() - header_start) / 8;
        Ok(RtpRecord {
            position,
            record_length,
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            header_length,
        })
    }

    /// Checks a record against the session's stream identity, establishing
    /// that identity from the first record that carries neither padding nor
    /// extension.  Sequence continuity is advisory: gaps are logged and the
    /// offending record still accepted as the new baseline.
    pub fn validate(&mut self, record: &RtpRecord) -> Result<(), RejectReason> {
        if record.padding {
            return Err(RejectReason::Padding);
        }
        if record.extension {
            return Err(RejectReason::Extension);
        }
        match self.state.ssrc {
            None => self.state.ssrc = Some(record.ssrc),
            Some(expected) if expected != record.ssrc => {
                return Err(RejectReason::ForeignSsrc {
                    expected,
                    actual: record.ssrc,
                })
            }
            Some(_) => (),
        }
        match self.state.payload_type {
            None => self.state.payload_type = Some(record.payload_type),
            Some(expected) if expected != record.payload_type => {
                return Err(RejectReason::ForeignPayloadType {
                    expected,
                    actual: record.payload_type,
                })
            }
            Some(_) => (),
        }
        match self.state.last_sequence {
            None => self.state.first_sequence = Some(record.sequence_number),
            Some(last) if last.wrapping_add(1) != record.sequence_number => {
                warn!(
                    "sequence discontinuity: {} does not follow {}",
                    record.sequence_number, last
                );
                self.state.discontinuities += 1;
            }
            Some(_) => (),
        }
        self.state.last_sequence = Some(record.sequence_number);
        Ok(())
    }

    /// Steps the cursor over a rejected record's payload, trusting the
    /// capture-format length so the next record is decoded from the right
    /// place.
    pub fn skip_invalid(&mut self, record: &RtpRecord) -> Result<(), RtpError> {
        let len = record.payload_length()?;
        let position = self.reader.byte_position();
        self.reader
            .skip(len * 8)
            .map_err(|_| RtpError::UnexpectedEndOfStream { position })
    }

    fn take_payload(&mut self, record: &RtpRecord) -> Result<&'buf [u8], RtpError> {
        let len = record.payload_length()?;
        let position = self.reader.byte_position();
        self.reader
            .take(len)
            .map_err(|_| RtpError::UnexpectedEndOfStream { position })
    }

    /// Runs the decode loop until the buffer is exhausted, a sink reports
    /// completion, or a fatal error ends the session.
    pub fn run<P: PacketSink>(&mut self, sink: &mut P) -> Result<SessionEnd, RtpError> {
        while self.reader.remaining() > 0 {
            let record = self.decode_next()?;
            if let Err(reason) = self.validate(&record) {
                warn!("record at {:#x} rejected: {:?}", record.position, reason);
                self.state.rejected_count += 1;
                self.skip_invalid(&record)?;
                continue;
            }
            self.state.packet_count += 1;
            let payload_start = self.reader.byte_position();
            let payload = self.take_payload(&record)?;
            self.collect(payload_start, payload);
            let raw = &self.buf
                [record.position..record.position + 2 + usize::from(record.record_length)];
            match sink.packet(&record, raw)? {
                PacketFlow::Continue => (),
                PacketFlow::Complete => return Ok(SessionEnd::ForwardComplete),
            }
        }
        Ok(SessionEnd::EndOfStream)
    }

    /// A diagnostic pass: decodes records from the cursor onward, without
    /// validation, until one's payload contains `needle`.
    ///
    /// Panics if `needle` is empty.
    pub fn scan_for(&mut self, needle: &[u8]) -> Result<Option<SearchHit>, RtpError> {
        assert!(!needle.is_empty());
        while self.reader.remaining() > 0 {
            let record = self.decode_next()?;
            let payload_start = self.reader.byte_position();
            let payload = self.take_payload(&record)?;
            if let Some(i) = find_bytes(payload, needle) {
                let kind = if find_start_byte(payload, 0xe0).is_some() {
                    Some(ElementaryKind::Video)
                } else if find_start_byte(payload, 0xc0).is_some() {
                    Some(ElementaryKind::Audio)
                } else {
                    None
                };
                return Ok(Some(SearchHit {
                    position: payload_start + i,
                    sequence_number: record.sequence_number,
                    kind,
                }));
            }
        }
        Ok(None)
    }

    fn collect(&mut self, payload_start: usize, payload: &[u8]) {
        if let Some(i) = find_start_byte(payload, 0xbb) {
            self.state.last_key_unit_position = Some(payload_start + i);
            if !self.state.key_seen {
                self.state.key_seen = true;
                // open the reconstruction at the pack header so the program
                // stream parser starts on a pack boundary
                let from = find_start_byte(payload, 0xba).unwrap_or(i);
                debug!(
                    "payload becomes parseable at capture offset {:#x}",
                    payload_start + from
                );
                self.payload.extend_from_slice(&payload[from..]);
                return;
            }
        }
        if self.state.key_seen {
            self.payload.extend_from_slice(payload);
        }
    }
}

fn find_start_byte(data: &[u8], code: u8) -> Option<usize> {
    data.windows(4).position(|w| w == [0x00, 0x00, 0x01, code])
}

fn find_bytes(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len()).position(|w| w == needle)
}
