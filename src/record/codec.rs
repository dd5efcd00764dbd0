//! Byte layout of a record file: a little-endian `u32` uncompressed-size
//! header followed by a host-compressed payload of back-to-back
//! `RecordFrame` structs.

use crate::error::TasError;
use crate::record::RecordCompressor;

/// One tick's worth of recorded input. The bitfield reserves nine
/// fields though only eight are produced by the recorder today (`enter`
/// is reserved, unused) — see the open question this resolves in the
/// expanded design notes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecordFrame {
    pub delta_time_ms: f32,
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub q: bool,
    pub shift: bool,
    pub space: bool,
    pub esc: bool,
    pub enter: bool,
}

/// Packed size on disk: `f32` delta plus one byte holding all nine bit
/// fields.
pub const FRAME_SIZE: usize = 4 + 1;

impl RecordFrame {
    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.delta_time_ms.to_le_bytes());
        let mut mask = 0u8;
        if self.up {
            mask |= 1 << 0;
        }
        if self.down {
            mask |= 1 << 1;
        }
        if self.left {
            mask |= 1 << 2;
        }
        if self.right {
            mask |= 1 << 3;
        }
        if self.q {
            mask |= 1 << 4;
        }
        if self.shift {
            mask |= 1 << 5;
        }
        if self.space {
            mask |= 1 << 6;
        }
        if self.esc {
            mask |= 1 << 7;
        }
        out.push(mask);
    }

    fn unpack(bytes: &[u8]) -> RecordFrame {
        debug_assert_eq!(bytes.len(), FRAME_SIZE);
        let delta_time_ms = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mask = bytes[4];
        RecordFrame {
            delta_time_ms,
            up: mask & (1 << 0) != 0,
            down: mask & (1 << 1) != 0,
            left: mask & (1 << 2) != 0,
            right: mask & (1 << 3) != 0,
            q: mask & (1 << 4) != 0,
            shift: mask & (1 << 5) != 0,
            space: mask & (1 << 6) != 0,
            esc: mask & (1 << 7) != 0,
            enter: false,
        }
    }

    pub fn bit(&self, field: KeyField) -> bool {
        match field {
            KeyField::Up => self.up,
            KeyField::Down => self.down,
            KeyField::Left => self.left,
            KeyField::Right => self.right,
            KeyField::Q => self.q,
            KeyField::Shift => self.shift,
            KeyField::Space => self.space,
            KeyField::Esc => self.esc,
            KeyField::Enter => self.enter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    Up,
    Down,
    Left,
    Right,
    Q,
    Shift,
    Space,
    Esc,
    Enter,
}

pub const ALL_KEY_FIELDS: [KeyField; 9] = [
    KeyField::Up,
    KeyField::Down,
    KeyField::Left,
    KeyField::Right,
    KeyField::Q,
    KeyField::Shift,
    KeyField::Space,
    KeyField::Esc,
    KeyField::Enter,
];

/// Produces the on-disk bytes for a sequence of frames, including the
/// 4-byte uncompressed-size header.
pub fn pack_record(frames: &[RecordFrame], compressor: &dyn RecordCompressor) -> Vec<u8> {
    let mut uncompressed = Vec::with_capacity(frames.len() * FRAME_SIZE);
    for frame in frames {
        frame.pack(&mut uncompressed);
    }
    let compressed = compressor.compress(&uncompressed);
    let mut out = Vec::with_capacity(4 + compressed.len());
    out.extend_from_slice(&(uncompressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    out
}

/// Parses a record file's bytes into a frame vector, following
/// `RecordPlayer::LoadRecord`: read the 4-byte header, accept `U == 0`
/// as an explicitly empty (but valid) record, reject any `U` that is
/// not a whole multiple of the frame size, then hand the remaining
/// bytes to the host decompressor and slice the result into frames.
pub fn unpack_record(
    bytes: &[u8],
    compressor: &dyn RecordCompressor,
) -> Result<Vec<RecordFrame>, TasError> {
    if bytes.len() < 4 {
        return Err(TasError::RecordCorrupt(
            "record file is shorter than the 4-byte size header".to_string(),
        ));
    }
    let uncompressed_size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if uncompressed_size == 0 {
        return Ok(Vec::new());
    }
    if uncompressed_size % FRAME_SIZE != 0 {
        return Err(TasError::RecordCorrupt(format!(
            "uncompressed size {uncompressed_size} is not a multiple of frame size {FRAME_SIZE}"
        )));
    }
    let payload = &bytes[4..];
    let uncompressed = compressor
        .decompress(payload, uncompressed_size)
        .map_err(TasError::RecordDecompressFailure)?;
    if uncompressed.len() != uncompressed_size {
        return Err(TasError::RecordDecompressFailure(format!(
            "decompressor returned {} bytes, expected {uncompressed_size}",
            uncompressed.len()
        )));
    }
    let frame_count = uncompressed_size / FRAME_SIZE;
    let mut frames = Vec::with_capacity(frame_count);
    for i in 0..frame_count {
        let start = i * FRAME_SIZE;
        frames.push(RecordFrame::unpack(&uncompressed[start..start + FRAME_SIZE]));
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IdentityCompressor;

    #[test]
    fn empty_record_round_trips() {
        let bytes = pack_record(&[], &IdentityCompressor);
        let frames = unpack_record(&bytes, &IdentityCompressor).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn frames_round_trip() {
        let frames = vec![
            RecordFrame {
                delta_time_ms: 16.66,
                up: true,
                ..Default::default()
            },
            RecordFrame {
                delta_time_ms: 16.66,
                space: true,
                esc: true,
                ..Default::default()
            },
        ];
        let bytes = pack_record(&frames, &IdentityCompressor);
        let back = unpack_record(&bytes, &IdentityCompressor).unwrap();
        assert_eq!(frames, back);
    }

    #[test]
    fn rejects_size_not_multiple_of_frame_size() {
        let mut bytes = vec![0u8; 4];
        bytes[0..4].copy_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 7]);
        assert!(unpack_record(&bytes, &IdentityCompressor).is_err());
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(unpack_record(&[0, 0], &IdentityCompressor).is_err());
    }
}
