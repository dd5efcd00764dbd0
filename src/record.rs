//! Binary record format, frame-accurate player. Grounded on
//! `RecordPlayer.cpp`'s `LoadRecord`/`Tick`/`ApplyFrameInput` and the
//! `RecordFrame` layout implied by it.

pub mod codec;
pub mod player;

pub use codec::{pack_record, unpack_record, RecordFrame, FRAME_SIZE};
pub use player::RecordPlayer;

/// Decompresses and compresses the record payload. Modeled as a trait
/// so a host can plug in whatever the game engine's own compressor is;
/// the core never implements or chooses a compression algorithm.
pub trait RecordCompressor {
    fn compress(&self, uncompressed: &[u8]) -> Vec<u8>;
    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, String>;
}

/// A no-op compressor used by tests and by hosts with no separate
/// compression stage (the payload is already raw frame bytes).
pub struct IdentityCompressor;

impl RecordCompressor for IdentityCompressor {
    fn compress(&self, uncompressed: &[u8]) -> Vec<u8> {
        uncompressed.to_vec()
    }

    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, String> {
        if compressed.len() != uncompressed_size {
            return Err(format!(
                "identity decompressor expected {uncompressed_size} bytes, got {}",
                compressed.len()
            ));
        }
        Ok(compressed.to_vec())
    }
}
