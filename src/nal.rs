//! Just enough H.264 NAL unit inspection to classify the frames a Program
//! Stream carries.
//!
//! Video PES payloads in the captures this crate targets open with a 4-byte
//! Annex-B start-code prefix followed by a NAL header byte.  Frame-type
//! statistics only need that one byte; no slice-layer parsing happens here.

/// Classification of the NAL unit opening a video frame payload.
///
/// The byte values are whole NAL header bytes as they appear in these
/// captures (`forbidden_zero_bit`, `nal_ref_idc` and `nal_unit_type`
/// together), not bare `nal_unit_type` codes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnitType {
    /// Sequence parameter set (header byte `0x67`)
    Sps,
    /// Picture parameter set (header byte `0x68`)
    Pps,
    /// IDR slice, opening an I frame (header byte `0x65`)
    Idr,
    /// Non-IDR slice, opening a P frame in this capture profile (header byte
    /// `0x61`)
    NonIdr,
    /// Any other header byte
    Other(u8),
}
impl From<u8> for UnitType {
    fn from(b: u8) -> UnitType {
        match b {
            0x67 => UnitType::Sps,
            0x68 => UnitType::Pps,
            0x65 => UnitType::Idr,
            0x61 => UnitType::NonIdr,
            b => UnitType::Other(b),
        }
    }
}

/// Classifies a video frame payload by the NAL header byte following the
/// 4-byte Annex-B prefix, or `None` for payloads too short to carry one.
///
/// The prefix itself is assumed, not checked; payloads that open with
/// something else just land in [`UnitType::Other`].
pub fn classify(payload: &[u8]) -> Option<UnitType> {
    payload.get(4).map(|&b| UnitType::from(b))
}

/// Returns the leading bytes of a raw Annex-B stream up to (not including)
/// the first non-IDR slice, i.e. the parameter sets plus the first key
/// frame.  Returns the whole buffer when no non-IDR slice is present.
pub fn first_access_unit(data: &[u8]) -> &[u8] {
    let mut from = 0;
    while let Some(pos) = find_prefix(data, from) {
        if let Some(&b) = data.get(pos + 4) {
            if b & 0b0001_1111 == 1 {
                return &data[..pos];
            }
        }
        // two 4-byte prefixes cannot overlap, so resume past this one
        from = pos + 4;
    }
    data
}

fn find_prefix(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(4)
        .position(|w| w == [0x00, 0x00, 0x00, 0x01])
        .map(|i| from + i)
}
