//! Program Stream pack layer: start-code dispatch, pack and system headers,
//! the _Program Stream Map_, and PES payload extraction.
//!
//! The stream is assumed start-code aligned: every structural unit opens with
//! a 4-byte `00 00 01 xx` marker, and the decode loop dispatches on that
//! marker until the buffer is exhausted.  PES payload lengths are
//! cross-checked against the position of the following start code before
//! they are trusted; a length that does not land on one triggers
//! [resynchronization](PsDecoder::run), a forward scan for the next valid
//! start code, with the intervening bytes surfaced as a 'recovered' frame
//! rather than silently dropped.

use crate::bitreader::{BitReader, InsufficientData};
use crate::nal;
use crate::{ElementaryKind, SessionEnd, StreamType};
use log::{debug, warn};
use std::fmt;
use std::io;

/// Errors which may terminate a Program Stream decode session.
#[derive(Debug)]
pub enum PsError {
    /// The 32 bits at a dispatch point did not form any known start code;
    /// the stream is not start-code aligned and there is no local recovery
    UnknownStartCode {
        /// the offending 32-bit value
        code: u32,
        /// byte offset at which it was read
        position: usize,
    },
    /// The buffer ended inside a fixed header structure
    TruncatedHeader {
        /// name of the syntax element being read
        field: &'static str,
        /// number of bits the element needed
        requested: usize,
        /// number of bits the buffer still held
        available: usize,
    },
    /// The Program Stream Map's internal length accounting failed its
    /// cross-check (the map length less all consumed sub-lengths must leave
    /// exactly the 4-byte CRC)
    MalformedProgramStreamMap {
        /// the map length the stream declared
        declared: u16,
        /// bytes left over after the elementary stream map, expected to be 4
        remainder: i64,
    },
    /// A resynchronization scan reached the end of the buffer without
    /// finding another start code
    UnexpectedEndOfStream {
        /// byte offset at which the scan began
        position: usize,
    },
    /// A sink refused the data
    Io(io::Error),
}
impl From<io::Error> for PsError {
    fn from(e: io::Error) -> PsError {
        PsError::Io(e)
    }
}

fn truncated(field: &'static str) -> impl FnOnce(InsufficientData) -> PsError {
    move |e| PsError::TruncatedHeader {
        field,
        requested: e.requested,
        available: e.available,
    }
}

/// Identity of the structural unit a 4-byte start code introduces.
///
/// The set is closed: anything not listed here fails
/// [`StartCode::from_u32()`], which the decode loop treats as fatal.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StartCode {
    /// `0x000001BA`, opening a pack header
    PackHeader,
    /// `0x000001BB`, opening a system header
    SystemHeader,
    /// `0x000001BC`, opening the Program Stream Map
    ProgramStreamMap,
    /// `0x000001E0..=0x000001EF`, a video PES packet; the value is the
    /// stream number from the low 4 bits of the stream id
    VideoPes(u8),
    /// `0x000001C0..=0x000001DF`, an audio PES packet; the value is the
    /// stream number from the low 5 bits of the stream id
    AudioPes(u8),
}
impl StartCode {
    /// Matches a 32-bit value against the known start codes.
    pub fn from_u32(code: u32) -> Option<StartCode> {
        if code >> 8 != 0x00_0001 {
            return None;
        }
        match (code & 0xff) as u8 {
            0xba => Some(StartCode::PackHeader),
            0xbb => Some(StartCode::SystemHeader),
            0xbc => Some(StartCode::ProgramStreamMap),
            id @ 0xe0..=0xef => Some(StartCode::VideoPes(id & 0b0000_1111)),
            id @ 0xc0..=0xdf => Some(StartCode::AudioPes(id & 0b0001_1111)),
            _ => None,
        }
    }
}

/// Scans `buf` forward from the byte offset `from` for the next 4-byte
/// sequence forming a known start code, returning its offset.
///
/// This is the bounded search behind resynchronization; it never looks at
/// bytes before `from`.
pub fn next_start_code(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| {
            StartCode::from_u32(u32::from_be_bytes([w[0], w[1], w[2], w[3]])).is_some()
        })
        .map(|i| from + i)
}

/// A _System Clock Reference_ value from a pack header.
///
/// Comprises a 33-bit, 90kHz `base` component together with a 9-bit
/// high-resolution `extension` component; together they can be viewed as a
/// 42-bit, 27MHz quantity (e.g. `let full_value: u64 = scr.into()`).
#[derive(Copy, Clone)]
pub struct ClockRef {
    base: u64,
    extension: u16,
}
impl PartialEq for ClockRef {
    fn eq(&self, other: &ClockRef) -> bool {
        self.base == other.base && self.extension == other.extension
    }
}
impl From<ClockRef> for u64 {
    fn from(scr: ClockRef) -> u64 {
        scr.base * 300 + u64::from(scr.extension)
    }
}
impl fmt::Debug for ClockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "SCR{{{:08x}:{:04x}}}", self.base, self.extension)
    }
}
impl ClockRef {
    /// Panics if the `base` is greater than 2^33-1 or the `extension` is
    /// greater than 2^9-1
    pub fn from_parts(base: u64, extension: u16) -> ClockRef {
        assert!(base < (1 << 33));
        assert!(extension < (1 << 9));
        ClockRef { base, extension }
    }
    /// get the 33-bit, 90kHz 'base' component of the clock reference
    pub fn base(&self) -> u64 {
        self.base
    }
    /// get the 9-bit 'extension' component of the clock reference, measured
    /// in 300ths of the 90kHz base clockrate (i.e. 27MHz)
    pub fn extension(&self) -> u16 {
        self.extension
    }
}

/// The fourteen fixed-width fields of a pack header, in wire order.
///
/// The system clock reference arrives split into three base parts with
/// marker bits interleaved; [`PackHeader::system_clock_reference()`]
/// reassembles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    /// 2 bits, `0b01` in well-formed streams
    pub fixed: u8,
    /// bits 32..30 of the SCR base (3 bits)
    pub system_clock_reference_base1: u32,
    pub marker_bit1: u8,
    /// bits 29..15 of the SCR base (15 bits)
    pub system_clock_reference_base2: u32,
    pub marker_bit2: u8,
    /// bits 14..0 of the SCR base (15 bits)
    pub system_clock_reference_base3: u32,
    pub marker_bit3: u8,
    /// 9-bit SCR extension
    pub system_clock_reference_extension: u16,
    pub marker_bit4: u8,
    /// 22-bit program mux rate, in units of 50 bytes/second
    pub program_mux_rate: u32,
    pub marker_bit5: u8,
    pub marker_bit6: u8,
    /// 5 reserved bits
    pub reserved: u8,
    /// number of stuffing bytes following the header (3 bits)
    pub pack_stuffing_length: u8,
}
impl PackHeader {
    fn read(r: &mut BitReader<'_>) -> Result<PackHeader, InsufficientData> {
        Ok(PackHeader {
            fixed: r.read(2)? as u8,
            system_clock_reference_base1: r.read(3)?,
            marker_bit1: r.read(1)? as u8,
            system_clock_reference_base2: r.read(15)?,
            marker_bit2: r.read(1)? as u8,
            system_clock_reference_base3: r.read(15)?,
            marker_bit3: r.read(1)? as u8,
            system_clock_reference_extension: r.read(9)? as u16,
            marker_bit4: r.read(1)? as u8,
            program_mux_rate: r.read(22)?,
            marker_bit5: r.read(1)? as u8,
            marker_bit6: r.read(1)? as u8,
            reserved: r.read(5)? as u8,
            pack_stuffing_length: r.read(3)? as u8,
        })
    }

    /// The system clock reference carried by this pack header, reassembled
    /// from its three base parts and extension.
    pub fn system_clock_reference(&self) -> ClockRef {
        let base = u64::from(self.system_clock_reference_base1) << 30
            | u64::from(self.system_clock_reference_base2) << 15
            | u64::from(self.system_clock_reference_base3);
        ClockRef::from_parts(base, self.system_clock_reference_extension)
    }
}

/// Tags whether a frame was delimited by a trustworthy length field, or
/// recovered by scanning for the next start code after a corrupt one.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Validity {
    Clean,
    Recovered,
}

/// One demultiplexed elementary stream payload, borrowed from the session
/// buffer.
#[derive(Debug)]
pub struct ElementaryFrame<'buf> {
    pub kind: ElementaryKind,
    pub validity: Validity,
    pub data: &'buf [u8],
}

/// Receives each elementary frame as the decoder produces it.
///
/// Recovered frames are delivered as well as clean ones, so an
/// implementation that only wants intact data must check
/// [`ElementaryFrame::validity`].
pub trait FrameSink {
    fn frame(&mut self, frame: &ElementaryFrame<'_>) -> io::Result<()>;
}

/// Counters accumulated across one decode session.  All are monotonic, and
/// exposed read-only.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PsStats {
    video_frames: u64,
    video_frame_errors: u64,
    audio_frames: u64,
    audio_frame_errors: u64,
    i_frames: u64,
    i_frame_errors: u64,
    p_frames: u64,
    sps_units: u64,
    pps_units: u64,
    program_stream_maps: u64,
}
impl PsStats {
    /// video PES packets encountered, whether or not their length checked out
    pub fn video_frames(&self) -> u64 {
        self.video_frames
    }
    /// video frames recovered by resynchronization
    pub fn video_frame_errors(&self) -> u64 {
        self.video_frame_errors
    }
    /// video frames whose declared length checked out
    pub fn valid_video_frames(&self) -> u64 {
        self.video_frames - self.video_frame_errors
    }
    /// audio PES packets encountered
    pub fn audio_frames(&self) -> u64 {
        self.audio_frames
    }
    /// audio frames recovered by resynchronization
    pub fn audio_frame_errors(&self) -> u64 {
        self.audio_frame_errors
    }
    /// I frames arriving in clean video frames
    pub fn i_frames(&self) -> u64 {
        self.i_frames
    }
    /// I frames arriving in recovered video frames
    pub fn i_frame_errors(&self) -> u64 {
        self.i_frame_errors
    }
    /// P frames
    pub fn p_frames(&self) -> u64 {
        self.p_frames
    }
    /// sequence parameter sets
    pub fn sps_units(&self) -> u64 {
        self.sps_units
    }
    /// picture parameter sets
    pub fn pps_units(&self) -> u64 {
        self.pps_units
    }
    /// Program Stream Map occurrences
    pub fn program_stream_maps(&self) -> u64 {
        self.program_stream_maps
    }
}
impl fmt::Display for PsStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "video: {} frames ({} recovered), audio: {} frames ({} recovered), \
             I: {} (+{} in error), P: {}, SPS: {}, PPS: {}, PSM: {}",
            self.video_frames,
            self.video_frame_errors,
            self.audio_frames,
            self.audio_frame_errors,
            self.i_frames,
            self.i_frame_errors,
            self.p_frames,
            self.sps_units,
            self.pps_units,
            self.program_stream_maps,
        )
    }
}

/// State that persists across one Program Stream decode session: the stream
/// types learned from the Program Stream Map, the most recent pack header,
/// and the frame counters.
#[derive(Debug, Default)]
pub struct PsSessionState {
    video_stream_type: Option<StreamType>,
    audio_stream_type: Option<StreamType>,
    last_pack_header: Option<PackHeader>,
    stats: PsStats,
}
impl PsSessionState {
    pub fn new() -> PsSessionState {
        Default::default()
    }
    /// the video stream type declared by the Program Stream Map, once one
    /// has been seen
    pub fn video_stream_type(&self) -> Option<StreamType> {
        self.video_stream_type
    }
    /// the audio stream type declared by the Program Stream Map, once one
    /// has been seen
    pub fn audio_stream_type(&self) -> Option<StreamType> {
        self.audio_stream_type
    }
    /// the most recently decoded pack header
    pub fn last_pack_header(&self) -> Option<&PackHeader> {
        self.last_pack_header.as_ref()
    }
    pub fn stats(&self) -> &PsStats {
        &self.stats
    }
}

/// Decoder for a buffer of Program Stream data.
///
/// The whole stream must be resident in the buffer; this is a debugging
/// tool's decoder, not a streaming one.  Construct, optionally set a video
/// frame cap, then call [`run()`](PsDecoder::run) with the session state and
/// a [`FrameSink`].
pub struct PsDecoder<'buf> {
    reader: BitReader<'buf>,
    buf: &'buf [u8],
    video_frame_cap: Option<u64>,
}
impl<'buf> PsDecoder<'buf> {
    pub fn new(buf: &'buf [u8]) -> PsDecoder<'buf> {
        PsDecoder {
            reader: BitReader::new(buf),
            buf,
            video_frame_cap: None,
        }
    }

    /// Limits the number of video frames the session will hand to the sink;
    /// once that many have been produced the session ends with
    /// [`SessionEnd::DumpComplete`].
    pub fn set_video_frame_cap(&mut self, cap: Option<u64>) {
        self.video_frame_cap = cap;
    }

    /// Runs the decode loop until the buffer is exhausted, the video frame
    /// cap is reached, or a fatal error ends the session.
    ///
    /// The session state is threaded through every handler and left holding
    /// the final counters whichever way the session ends.
    pub fn run<S: FrameSink>(
        &mut self,
        state: &mut PsSessionState,
        sink: &mut S,
    ) -> Result<SessionEnd, PsError> {
        while self.reader.remaining() > 0 {
            let position = self.reader.byte_position();
            let code = self
                .reader
                .read(32)
                .map_err(truncated("pack_start_code"))?;
            match StartCode::from_u32(code) {
                None => return Err(PsError::UnknownStartCode { code, position }),
                Some(StartCode::PackHeader) => self.pack_header(state)?,
                Some(StartCode::SystemHeader) => self.system_header()?,
                Some(StartCode::ProgramStreamMap) => self.program_stream_map(state)?,
                Some(StartCode::VideoPes(stream)) => {
                    self.pes(ElementaryKind::Video, stream, state, sink)?
                }
                Some(StartCode::AudioPes(stream)) => {
                    self.pes(ElementaryKind::Audio, stream, state, sink)?
                }
            }
            if let Some(cap) = self.video_frame_cap {
                if state.stats.video_frames >= cap {
                    debug!("video frame cap of {} reached", cap);
                    return Ok(SessionEnd::DumpComplete);
                }
            }
        }
        Ok(SessionEnd::EndOfStream)
    }

    fn pack_header(&mut self, state: &mut PsSessionState) -> Result<(), PsError> {
        let header = PackHeader::read(&mut self.reader).map_err(truncated("pack_header"))?;
        self.reader
            .skip(usize::from(header.pack_stuffing_length) * 8)
            .map_err(truncated("pack_stuffing"))?;
        debug!(
            "pack header: scr={:?} mux_rate={} stuffing={}",
            header.system_clock_reference(),
            header.program_mux_rate,
            header.pack_stuffing_length
        );
        state.last_pack_header = Some(header);
        Ok(())
    }

    fn system_header(&mut self) -> Result<(), PsError> {
        let len = self
            .reader
            .read(16)
            .map_err(truncated("system_header_length"))? as usize;
        self.reader
            .skip(len * 8)
            .map_err(truncated("system_header"))?;
        debug!("system header, {} bytes skipped", len);
        Ok(())
    }

    fn program_stream_map(&mut self, state: &mut PsSessionState) -> Result<(), PsError> {
        state.stats.program_stream_maps += 1;
        let declared = self
            .reader
            .read(16)
            .map_err(truncated("program_stream_map_length"))? as u16;
        let mut remaining = i64::from(declared);
        // current_next_indicator, version and their markers are accounted
        // for but not used,
        self.reader
            .skip(16)
            .map_err(truncated("program_stream_map_version"))?;
        remaining -= 2;
        let info_length = self
            .reader
            .read(16)
            .map_err(truncated("program_stream_info_length"))? as usize;
        self.reader
            .skip(info_length * 8)
            .map_err(truncated("program_stream_info"))?;
        remaining -= info_length as i64 + 2;
        let map_length = self
            .reader
            .read(16)
            .map_err(truncated("elementary_stream_map_length"))? as i64;
        remaining -= 2;
        let mut map_remaining = map_length;
        while map_remaining > 0 {
            let stream_type = StreamType::from(
                self.reader.read(8).map_err(truncated("stream_type"))? as u8,
            );
            let elementary_stream_id =
                self.reader
                    .read(8)
                    .map_err(truncated("elementary_stream_id"))? as u8;
            let info_length = self
                .reader
                .read(16)
                .map_err(truncated("elementary_stream_info_length"))?
                as usize;
            self.reader
                .skip(info_length * 8)
                .map_err(truncated("elementary_stream_info"))?;
            let consumed = 4 + info_length as i64;
            map_remaining -= consumed;
            remaining -= consumed;
            match elementary_stream_id {
                0xe0..=0xef => {
                    debug!(
                        "program stream map: video stream {:#04x} has type {:?}",
                        elementary_stream_id, stream_type
                    );
                    state.video_stream_type = Some(stream_type);
                }
                0xc0..=0xdf => {
                    debug!(
                        "program stream map: audio stream {:#04x} has type {:?}",
                        elementary_stream_id, stream_type
                    );
                    state.audio_stream_type = Some(stream_type);
                }
                id => debug!(
                    "program stream map names elementary stream id {:#04x}, which this \
                     decoder does not track",
                    id
                ),
            }
        }
        // whatever the lengths consumed, exactly the 4-byte CRC must remain
        if remaining != 4 {
            return Err(PsError::MalformedProgramStreamMap {
                declared,
                remainder: remaining,
            });
        }
        self.reader
            .skip(32)
            .map_err(truncated("program_stream_map_crc"))?;
        Ok(())
    }

    fn pes<S: FrameSink>(
        &mut self,
        kind: ElementaryKind,
        stream: u8,
        state: &mut PsSessionState,
        sink: &mut S,
    ) -> Result<(), PsError> {
        match kind {
            ElementaryKind::Video => state.stats.video_frames += 1,
            ElementaryKind::Audio => state.stats.audio_frames += 1,
        }
        let declared = self
            .reader
            .read(16)
            .map_err(truncated("pes_packet_length"))? as usize;
        self.reader.skip(16).map_err(truncated("pes_flags"))?;
        let header_data_length = self
            .reader
            .read(8)
            .map_err(truncated("pes_header_data_length"))? as usize;
        self.reader
            .skip(header_data_length * 8)
            .map_err(truncated("pes_header_data"))?;
        let position = self.reader.byte_position();
        match declared.checked_sub(2 + 1 + header_data_length) {
            Some(len) if self.payload_boundary_ok(position, len) => {
                let payload = self.reader.take(len).map_err(truncated("pes_payload"))?;
                debug!("{:?} PES stream {}: {} byte payload", kind, stream, len);
                self.emit(kind, Validity::Clean, payload, state, sink)
            }
            _ => {
                warn!(
                    "{:?} PES stream {} at {:#x} declares a length of {} bytes, which does \
                     not land on a start code; resynchronizing",
                    kind, stream, position, declared
                );
                self.resync(kind, state, sink)
            }
        }
    }

    /// A payload of `len` bytes from `position` is acceptable when it either
    /// ends exactly at the end of the buffer, or is immediately followed by
    /// a known start code.
    fn payload_boundary_ok(&self, position: usize, len: usize) -> bool {
        let end = match position.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        if end == self.buf.len() {
            return true;
        }
        match self.buf.get(end..end + 4) {
            Some(w) => {
                StartCode::from_u32(u32::from_be_bytes([w[0], w[1], w[2], w[3]])).is_some()
            }
            None => false,
        }
    }

    fn resync<S: FrameSink>(
        &mut self,
        kind: ElementaryKind,
        state: &mut PsSessionState,
        sink: &mut S,
    ) -> Result<(), PsError> {
        let from = self.reader.byte_position();
        match next_start_code(self.buf, from) {
            Some(found) => {
                let span = self
                    .reader
                    .take(found - from)
                    .map_err(truncated("recovered_frame"))?;
                match kind {
                    ElementaryKind::Video => state.stats.video_frame_errors += 1,
                    ElementaryKind::Audio => state.stats.audio_frame_errors += 1,
                }
                debug!(
                    "resynchronized: {} bytes of {:?} recovered at {:#x}",
                    span.len(),
                    kind,
                    from
                );
                self.emit(kind, Validity::Recovered, span, state, sink)
            }
            None => Err(PsError::UnexpectedEndOfStream { position: from }),
        }
    }

    fn emit<S: FrameSink>(
        &mut self,
        kind: ElementaryKind,
        validity: Validity,
        data: &[u8],
        state: &mut PsSessionState,
        sink: &mut S,
    ) -> Result<(), PsError> {
        if kind == ElementaryKind::Video {
            match nal::classify(data) {
                Some(nal::UnitType::Sps) => state.stats.sps_units += 1,
                Some(nal::UnitType::Pps) => state.stats.pps_units += 1,
                Some(nal::UnitType::Idr) => match validity {
                    Validity::Clean => state.stats.i_frames += 1,
                    Validity::Recovered => state.stats.i_frame_errors += 1,
                },
                Some(nal::UnitType::NonIdr) => state.stats.p_frames += 1,
                _ => (),
            }
        }
        let frame = ElementaryFrame {
            kind,
            validity,
            data,
        };
        sink.frame(&frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::ps::*;
    use crate::{ElementaryKind, SessionEnd};
    use assert_matches::assert_matches;
    use bitstream_io::{BigEndian, BitWrite};
    use bitstream_io::{BitWriter, BE};
    use hex_literal::*;
    use std::io;

    fn make_test_data<F>(builder: F) -> Vec<u8>
    where
        F: Fn(&mut BitWriter<Vec<u8>, BE>) -> Result<(), io::Error>,
    {
        let data: Vec<u8> = Vec::new();
        let mut w = BitWriter::endian(data, BigEndian);
        builder(&mut w).unwrap();
        w.into_writer()
    }

    /// `base` is a 33-bit value, `extension` 9 bits, `mux_rate` 22 bits
    fn write_pack_header(
        w: &mut BitWriter<Vec<u8>, BE>,
        base: u64,
        extension: u16,
        mux_rate: u32,
        stuffing: &[u8],
    ) -> Result<(), io::Error> {
        assert!(base < 1u64 << 33);
        assert!(stuffing.len() < 8);
        w.write(32, 0x0000_01bau32)?; // pack_start_code
        w.write(2, 0b01)?; // fixed
        w.write(3, (base >> 30) & 0b111)?;
        w.write(1, 1)?; // marker_bit
        w.write(15, (base >> 15) & 0x7fff)?;
        w.write(1, 1)?; // marker_bit
        w.write(15, base & 0x7fff)?;
        w.write(1, 1)?; // marker_bit
        w.write(9, extension)?;
        w.write(1, 1)?; // marker_bit
        w.write(22, mux_rate)?;
        w.write(1, 1)?; // marker_bit
        w.write(1, 1)?; // marker_bit
        w.write(5, 0b11111)?; // reserved
        w.write(3, stuffing.len() as u32)?; // pack_stuffing_length
        w.write_bytes(stuffing)
    }

    fn write_system_header(
        w: &mut BitWriter<Vec<u8>, BE>,
        contents: &[u8],
    ) -> Result<(), io::Error> {
        w.write(32, 0x0000_01bbu32)?; // system_header_start_code
        w.write(16, contents.len() as u32)?; // header_length
        w.write_bytes(contents)
    }

    /// entries are (stream_type, elementary_stream_id, descriptor bytes);
    /// `length_fudge` shifts the declared map length away from the correct
    /// value to provoke the accounting cross-check
    fn write_psm(
        w: &mut BitWriter<Vec<u8>, BE>,
        entries: &[(u8, u8, &[u8])],
        program_info: &[u8],
        length_fudge: i64,
    ) -> Result<(), io::Error> {
        let map_len: usize = entries.iter().map(|(_, _, info)| 4 + info.len()).sum();
        let declared = 2 + 2 + program_info.len() + 2 + map_len + 4;
        w.write(32, 0x0000_01bcu32)?; // packet_start_code + map_stream_id
        w.write(16, (declared as i64 + length_fudge) as u32)?; // program_stream_map_length
        w.write(16, 0xe001u32)?; // current_next_indicator .. marker_bit
        w.write(16, program_info.len() as u32)?; // program_stream_info_length
        w.write_bytes(program_info)?;
        w.write(16, map_len as u32)?; // elementary_stream_map_length
        for (stream_type, elementary_stream_id, info) in entries {
            w.write(8, u32::from(*stream_type))?;
            w.write(8, u32::from(*elementary_stream_id))?;
            w.write(16, info.len() as u32)?; // elementary_stream_info_length
            w.write_bytes(info)?;
        }
        w.write(32, 0x1234_5678u32) // CRC_32, unread by the decoder
    }

    /// a PES packet whose declared length may be overridden to something
    /// other than the correct value
    fn write_pes(
        w: &mut BitWriter<Vec<u8>, BE>,
        stream_id: u8,
        header_data: &[u8],
        payload: &[u8],
        declared: Option<u16>,
    ) -> Result<(), io::Error> {
        w.write(24, 1)?; // packet_start_code_prefix
        w.write(8, u32::from(stream_id))?; // stream_id
        let actual = 2 + 1 + header_data.len() + payload.len();
        w.write(16, u32::from(declared.unwrap_or(actual as u16)))?; // PES_packet_length
        w.write(16, 0x8080u32)?; // flag bits, skipped by the decoder
        w.write(8, header_data.len() as u32)?; // PES_header_data_length
        w.write_bytes(header_data)?;
        w.write_bytes(payload)
    }

    #[derive(Default)]
    struct MockSink {
        frames: Vec<(ElementaryKind, Validity, Vec<u8>)>,
    }
    impl FrameSink for MockSink {
        fn frame(&mut self, frame: &ElementaryFrame<'_>) -> io::Result<()> {
            self.frames
                .push((frame.kind, frame.validity, frame.data.to_vec()));
            Ok(())
        }
    }

    fn run(data: &[u8]) -> (Result<SessionEnd, PsError>, PsSessionState, MockSink) {
        let mut decoder = PsDecoder::new(data);
        let mut state = PsSessionState::new();
        let mut sink = MockSink::default();
        let end = decoder.run(&mut state, &mut sink);
        (end, state, sink)
    }

    #[test]
    fn start_codes() {
        assert_eq!(
            StartCode::from_u32(0x0000_01ba),
            Some(StartCode::PackHeader)
        );
        assert_eq!(
            StartCode::from_u32(0x0000_01e7),
            Some(StartCode::VideoPes(7))
        );
        assert_eq!(
            StartCode::from_u32(0x0000_01d9),
            Some(StartCode::AudioPes(0x19))
        );
        assert_eq!(StartCode::from_u32(0x0000_01b9), None);
        assert_eq!(StartCode::from_u32(0x0100_01ba), None);
    }

    #[test]
    fn scan_ignores_unknown_codes() {
        let data = hex!("00 00 01 77 ff 00 00 01 ba 44");
        assert_eq!(next_start_code(&data, 0), Some(5));
        assert_eq!(next_start_code(&data, 6), None);
        assert_eq!(next_start_code(&data, data.len() + 10), None);
    }

    #[test]
    fn empty_buffer() {
        let (end, state, sink) = run(&[]);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.stats().video_frames(), 0);
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn unknown_start_code() {
        // 0x000001B9 is the program end code, which this capture profile
        // never carries
        let data = hex!("00 00 01 b9");
        let (end, _, _) = run(&data);
        assert_matches!(
            end,
            Err(PsError::UnknownStartCode {
                code: 0x0000_01b9,
                position: 0,
            })
        );
    }

    #[test]
    fn trailing_garbage_shorter_than_a_start_code() {
        let data = hex!("00 00");
        let (end, _, _) = run(&data);
        assert_matches!(
            end,
            Err(PsError::TruncatedHeader {
                field: "pack_start_code",
                requested: 32,
                available: 16,
            })
        );
    }

    #[test]
    fn pack_header_with_stuffing() {
        // stuffing_length of 3 must skip exactly 3 bytes, leaving the next
        // dispatch on the system header that follows
        let data = make_test_data(|w| {
            write_pack_header(w, 0x1_2345_6789, 0x15e, 1234, &hex!("ff ff ff"))?;
            write_system_header(w, &hex!("80 c4 e1"))
        });
        let (end, state, _) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        let header = state.last_pack_header().unwrap();
        assert_eq!(header.fixed, 0b01);
        assert_eq!(header.pack_stuffing_length, 3);
        assert_eq!(header.program_mux_rate, 1234);
        assert_eq!(
            header.system_clock_reference(),
            ClockRef::from_parts(0x1_2345_6789, 0x15e)
        );
        assert_eq!(
            u64::from(header.system_clock_reference()),
            0x1_2345_6789 * 300 + 0x15e
        );
    }

    #[test]
    fn truncated_pack_header() {
        let data = hex!("00 00 01 ba 44 00 04");
        let (end, _, _) = run(&data);
        assert_matches!(
            end,
            Err(PsError::TruncatedHeader {
                field: "pack_header",
                ..
            })
        );
    }

    #[test]
    fn program_stream_map_learns_stream_types() {
        let data = make_test_data(|w| {
            write_psm(
                w,
                &[
                    (0x1b, 0xe0, &hex!("2a 7f ff 00 00 07 08 1f fe a0 5a")[..]),
                    (0x90, 0xc0, &hex!("0c 43 0a 06 01 40 fe 00 7d 03 03 e8")[..]),
                ],
                &[],
                0,
            )
        });
        let (end, state, _) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.video_stream_type(), Some(StreamType::H264));
        assert_eq!(state.audio_stream_type(), Some(StreamType::Private(0x90)));
        assert_eq!(state.stats().program_stream_maps(), 1);
    }

    #[test]
    fn program_stream_map_accounting_must_leave_the_crc() {
        let data = make_test_data(|w| {
            write_psm(w, &[(0x1b, 0xe0, &[])], &[], 1)
        });
        let (end, _, _) = run(&data);
        assert_matches!(
            end,
            Err(PsError::MalformedProgramStreamMap {
                remainder: 5,
                ..
            })
        );
    }

    #[test]
    fn clean_video_pes() {
        let payload = hex!("00 00 00 01 61 e0 20 23 57");
        let data = make_test_data(|w| {
            write_pes(w, 0xe0, &hex!("07 d2"), &payload, None)?;
            write_system_header(w, &[])
        });
        let (end, state, sink) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.stats().video_frames(), 1);
        assert_eq!(state.stats().valid_video_frames(), 1);
        assert_eq!(state.stats().video_frame_errors(), 0);
        assert_eq!(state.stats().p_frames(), 1);
        assert_eq!(
            sink.frames,
            vec![(
                ElementaryKind::Video,
                Validity::Clean,
                payload.to_vec()
            )]
        );
    }

    #[test]
    fn pes_payload_may_end_exactly_at_the_buffer_end() {
        let payload = hex!("00 00 00 01 65 88 80 10");
        let data = make_test_data(|w| write_pes(w, 0xe0, &[], &payload, None));
        let (end, state, sink) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.stats().valid_video_frames(), 1);
        assert_eq!(state.stats().i_frames(), 1);
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn corrupt_video_pes_length_resynchronizes() {
        // the declared length makes the payload 2 bytes, landing the
        // boundary check on garbage; the real boundary is 6 bytes in
        let next_payload = hex!("00 00 00 01 61 aa bb");
        let data = make_test_data(|w| {
            write_pes(
                w,
                0xe0,
                &[],
                &hex!("aa bb cc dd ee ff"),
                Some(2 + 1 + 2),
            )?;
            write_pes(w, 0xe0, &[], &next_payload, None)
        });
        let (end, state, sink) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.stats().video_frames(), 2);
        assert_eq!(state.stats().video_frame_errors(), 1);
        assert_eq!(state.stats().valid_video_frames(), 1);
        assert_eq!(
            sink.frames[0],
            (
                ElementaryKind::Video,
                Validity::Recovered,
                hex!("aa bb cc dd ee ff").to_vec()
            )
        );
        assert_eq!(
            sink.frames[1],
            (ElementaryKind::Video, Validity::Clean, next_payload.to_vec())
        );
    }

    #[test]
    fn corrupt_audio_pes_counts_against_the_audio_stream() {
        let data = make_test_data(|w| {
            write_pes(w, 0xc0, &[], &hex!("01 02 03 04 05"), Some(100))?;
            write_system_header(w, &[])
        });
        let (end, state, sink) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.stats().audio_frames(), 1);
        assert_eq!(state.stats().audio_frame_errors(), 1);
        assert_eq!(state.stats().video_frame_errors(), 0);
        assert_eq!(sink.frames[0].1, Validity::Recovered);
    }

    #[test]
    fn pes_declared_length_smaller_than_its_own_header() {
        // declared length of 2 cannot even cover the flag and length bytes,
        // so the decoder must fall back to scanning
        let data = make_test_data(|w| {
            write_pes(w, 0xe0, &[], &hex!("99 98 97"), Some(2))?;
            write_system_header(w, &[])
        });
        let (end, state, _) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.stats().video_frame_errors(), 1);
    }

    #[test]
    fn resync_scan_hitting_buffer_end_is_fatal() {
        let data = make_test_data(|w| {
            write_pes(w, 0xe0, &[], &hex!("aa bb cc dd ee ff 00 11"), Some(50))
        });
        let (end, _, _) = run(&data);
        assert_matches!(end, Err(PsError::UnexpectedEndOfStream { position: 9 }));
    }

    #[test]
    fn resync_never_rereads() {
        let data = make_test_data(|w| {
            write_pes(w, 0xe0, &[], &hex!("aa bb cc dd ee ff"), Some(2 + 1 + 2))?;
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 61 00"), None)
        });
        let mut decoder = PsDecoder::new(&data);
        let mut state = PsSessionState::new();
        let mut sink = MockSink::default();
        decoder.run(&mut state, &mut sink).unwrap();
        // both frames surfaced despite the corrupt length, and every byte of
        // the buffer was consumed exactly once
        assert_eq!(decoder.reader.byte_position(), data.len());
        let produced: usize = sink.frames.iter().map(|(_, _, d)| d.len()).sum();
        assert_eq!(produced, 12);
    }

    #[test]
    fn video_frame_cap_ends_the_session() {
        let data = make_test_data(|w| {
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 65 01"), None)?;
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 61 02"), None)?;
            write_system_header(w, &[])
        });
        let mut decoder = PsDecoder::new(&data);
        decoder.set_video_frame_cap(Some(1));
        let mut state = PsSessionState::new();
        let mut sink = MockSink::default();
        let end = decoder.run(&mut state, &mut sink);
        assert_matches!(end, Ok(SessionEnd::DumpComplete));
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(state.stats().video_frames(), 1);
    }

    #[test]
    fn sps_and_idr_classification() {
        let data = make_test_data(|w| {
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 67 42 00 1e"), None)?;
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 65 88 80 10"), None)
        });
        let (end, state, _) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(state.stats().sps_units(), 1);
        assert_eq!(state.stats().i_frames(), 1);
        assert_eq!(state.stats().i_frame_errors(), 0);
    }

    #[test]
    fn counters_partition_exactly() {
        let data = make_test_data(|w| {
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 65 01 02"), None)?;
            write_pes(w, 0xe0, &[], &hex!("aa bb cc dd ee ff"), Some(2 + 1 + 2))?;
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 61 03"), None)?;
            write_system_header(w, &[])
        });
        let (end, state, _) = run(&data);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        let stats = state.stats();
        assert_eq!(
            stats.valid_video_frames() + stats.video_frame_errors(),
            stats.video_frames()
        );
        assert_eq!(stats.video_frames(), 3);
        assert_eq!(stats.video_frame_errors(), 1);
    }

    #[test]
    fn mixed_session_consumes_the_whole_buffer() {
        let data = make_test_data(|w| {
            write_pack_header(w, 90_000, 0, 50_000, &[])?;
            write_system_header(w, &hex!("80 c4 e1 00 e1 ff"))?;
            write_psm(w, &[(0x1b, 0xe0, &[]), (0x90, 0xc0, &[])], &[], 0)?;
            write_pes(w, 0xe0, &hex!("07"), &hex!("00 00 00 01 67 42"), None)?;
            write_pes(w, 0xc0, &[], &hex!("2b 2c 2d 2e"), None)?;
            write_pes(w, 0xe0, &[], &hex!("00 00 00 01 65 88"), None)
        });
        let mut decoder = PsDecoder::new(&data);
        let mut state = PsSessionState::new();
        let mut sink = MockSink::default();
        let end = decoder.run(&mut state, &mut sink);
        assert_matches!(end, Ok(SessionEnd::EndOfStream));
        assert_eq!(decoder.reader.byte_position(), data.len());
        assert_eq!(state.stats().video_frames(), 2);
        assert_eq!(state.stats().audio_frames(), 1);
        assert_eq!(state.stats().sps_units(), 1);
        assert_eq!(state.stats().i_frames(), 1);
        assert_eq!(state.video_stream_type(), Some(StreamType::H264));
        assert_eq!(sink.frames.len(), 3);
    }
}
