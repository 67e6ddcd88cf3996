//! AVCC (length-prefixed, as stored in MP4) to Annex B (start-code) helpers.

use bytes::{Bytes, BytesMut};

const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// True when the buffer starts with a 3 or 4 byte start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(START_CODE) || data.starts_with(&START_CODE[1..])
}

/// Rewrites 4-byte length prefixes as start codes. A truncated trailing NAL
/// ends the conversion.
pub fn avcc_to_annexb(avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(avcc.len() + 16);
    let mut i = 0;
    while i + 4 <= avcc.len() {
        let len = u32::from_be_bytes([avcc[i], avcc[i + 1], avcc[i + 2], avcc[i + 3]]) as usize;
        i += 4;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// SPS and PPS of an `avcC` record as Annex B, or None if the record is
/// malformed.
pub fn avcc_parameter_sets(record: &[u8]) -> Option<Bytes> {
    // version, profile, compat, level, length size
    if record.len() < 7 || record[0] != 1 {
        return None;
    }
    let mut out = BytesMut::new();
    let mut pos = 5;

    let sps_count = (record[pos] & 0x1f) as usize;
    pos += 1;
    pos = copy_parameter_sets(record, pos, sps_count, &mut out)?;

    let pps_count = *record.get(pos)? as usize;
    pos += 1;
    copy_parameter_sets(record, pos, pps_count, &mut out)?;

    (!out.is_empty()).then(|| out.freeze())
}

fn copy_parameter_sets(record: &[u8], mut pos: usize, count: usize, out: &mut BytesMut) -> Option<usize> {
    for _ in 0..count {
        let len = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
        pos += 2;
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(record.get(pos..pos + len)?);
        pos += len;
    }
    Some(pos)
}
