/// Immutable session geometry shared by Master and UAVs.
///
/// Everything here is derived from the announce parameters; once a session
/// is established the geometry never changes.

use std::io;
use std::path::Path;

use crate::bitmap;
use crate::protocol::{self, SessionAnnounce};

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub file_id: u16,
    pub chunk_size: u32,
    pub window_size: u16,
    pub total_chunks: u32,
    pub filename: String,
}

impl SessionParams {
    /// Master-side construction from the source file.
    pub fn from_file(
        file_id: u16,
        path: &Path,
        chunk_size: u32,
        window_size: u16,
    ) -> io::Result<Self> {
        let file_size = std::fs::metadata(path)?.len();
        let total_chunks = file_size.div_ceil(chunk_size as u64);
        if total_chunks > u32::MAX as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file exceeds 32-bit chunk addressing at this chunk size",
            ));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        Ok(SessionParams {
            file_id,
            chunk_size,
            window_size,
            total_chunks: total_chunks as u32,
            filename,
        })
    }

    /// Receiver-side construction from an announce. Rejects geometry the
    /// protocol cannot represent (bitmap wider than 64, zero sizes,
    /// oversized chunks).
    pub fn from_announce(msg: &SessionAnnounce) -> Option<Self> {
        if msg.window_size == 0 || msg.window_size > 64 {
            return None;
        }
        if msg.chunk_size == 0 || msg.chunk_size > protocol::MAX_CHUNK_SIZE {
            return None;
        }
        Some(SessionParams {
            file_id: msg.file_id,
            chunk_size: msg.chunk_size,
            window_size: msg.window_size,
            total_chunks: msg.total_chunks,
            filename: protocol::decode_filename(&msg.filename),
        })
    }

    pub fn total_windows(&self) -> u32 {
        self.total_chunks.div_ceil(self.window_size as u32)
    }

    /// Chunks actually present in a window; the last one may be partial.
    pub fn chunks_in_window(&self, window_id: u32) -> u16 {
        let start = window_id as u64 * self.window_size as u64;
        let remaining = (self.total_chunks as u64).saturating_sub(start);
        remaining.min(self.window_size as u64) as u16
    }

    pub fn expected_bitmap(&self, window_id: u32) -> u64 {
        bitmap::expected_bitmap(self.chunks_in_window(window_id))
    }

    /// `(window_id, offset_in_window)` of a chunk.
    pub fn locate(&self, chunk_id: u32) -> (u32, u16) {
        (
            chunk_id / self.window_size as u32,
            (chunk_id % self.window_size as u32) as u16,
        )
    }

    pub fn first_chunk(&self, window_id: u32) -> u32 {
        window_id * self.window_size as u32
    }

    /// Byte range the protocol hashes: every chunk at full width.
    pub fn padded_len(&self) -> u64 {
        self.total_chunks as u64 * self.chunk_size as u64
    }

    pub fn announce(&self) -> SessionAnnounce {
        SessionAnnounce {
            file_id: self.file_id,
            total_chunks: self.total_chunks,
            window_size: self.window_size,
            chunk_size: self.chunk_size,
            filename: protocol::encode_filename(&self.filename),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(total_chunks: u32, window_size: u16) -> SessionParams {
        SessionParams {
            file_id: 1,
            chunk_size: 1024,
            window_size,
            total_chunks,
            filename: "f.bin".into(),
        }
    }

    #[test]
    fn window_geometry() {
        let p = params(130, 64);
        assert_eq!(p.total_windows(), 3);
        assert_eq!(p.chunks_in_window(0), 64);
        assert_eq!(p.chunks_in_window(1), 64);
        assert_eq!(p.chunks_in_window(2), 2);
        assert_eq!(p.expected_bitmap(0), u64::MAX);
        assert_eq!(p.expected_bitmap(2), 0b11);
    }

    #[test]
    fn locate_maps_chunks_to_windows() {
        let p = params(130, 64);
        assert_eq!(p.locate(0), (0, 0));
        assert_eq!(p.locate(63), (0, 63));
        assert_eq!(p.locate(64), (1, 0));
        assert_eq!(p.locate(129), (2, 1));
    }

    #[test]
    fn zero_length_file() {
        let p = params(0, 64);
        assert_eq!(p.total_windows(), 0);
        assert_eq!(p.padded_len(), 0);
    }

    #[test]
    fn announce_roundtrip() {
        let p = params(130, 64);
        let restored = SessionParams::from_announce(&p.announce()).unwrap();
        assert_eq!(restored.total_chunks, 130);
        assert_eq!(restored.filename, "f.bin");
    }

    #[test]
    fn announce_with_bad_geometry_is_rejected() {
        let mut a = params(10, 64).announce();
        a.window_size = 65;
        assert!(SessionParams::from_announce(&a).is_none());
        let mut a = params(10, 64).announce();
        a.chunk_size = 0;
        assert!(SessionParams::from_announce(&a).is_none());
    }
}
