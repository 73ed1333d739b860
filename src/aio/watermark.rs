//! Position/run watermark
//!
//! The first 16 bytes of every written block carry the block's own byte
//! position and the run identity, both little-endian. A read-back that finds
//! anything else at the head of the block has hit stale, misplaced or
//! foreign data.

/// Bytes reserved at the head of each written block
pub const WATERMARK_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub position: u64,
    pub run_uuid: u64,
}

impl Watermark {
    pub fn new(position: u64, run_uuid: u64) -> Self {
        Self { position, run_uuid }
    }

    /// Write the watermark into the head of `buf`
    ///
    /// Blocks shorter than the watermark get as much as fits.
    pub fn stamp(&self, buf: &mut [u8]) {
        let mut bytes = [0u8; WATERMARK_LEN];
        bytes[..8].copy_from_slice(&self.position.to_le_bytes());
        bytes[8..].copy_from_slice(&self.run_uuid.to_le_bytes());
        let n = buf.len().min(WATERMARK_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
    }

    /// Decode the watermark at the head of `buf`, zero-padding short blocks
    pub fn read(buf: &[u8]) -> Self {
        let mut bytes = [0u8; WATERMARK_LEN];
        let n = buf.len().min(WATERMARK_LEN);
        bytes[..n].copy_from_slice(&buf[..n]);

        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let position = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[8..]);
        let run_uuid = u64::from_le_bytes(word);
        Self { position, run_uuid }
    }

    /// Compare `buf` against this watermark, returning what was found on mismatch
    pub fn check(&self, buf: &[u8]) -> Result<(), Watermark> {
        let found = Self::read(buf);
        if found == *self {
            Ok(())
        } else {
            Err(found)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_layout() {
        let mut buf = vec![0xEEu8; 64];
        Watermark::new(0x0102, 0xAABB).stamp(&mut buf);
        assert_eq!(&buf[..2], &[0x02, 0x01]);
        assert_eq!(&buf[8..10], &[0xBB, 0xAA]);
        assert!(buf[WATERMARK_LEN..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_check_detects_wrong_position_and_run() {
        let mut buf = vec![0u8; 4096];
        let mark = Watermark::new(8192, 17);
        mark.stamp(&mut buf);
        assert!(mark.check(&buf).is_ok());

        assert_eq!(Watermark::new(4096, 17).check(&buf), Err(mark));
        assert_eq!(Watermark::new(8192, 18).check(&buf), Err(mark));
    }

    #[test]
    fn test_short_block() {
        let mut buf = vec![0u8; 8];
        Watermark::new(5, 9).stamp(&mut buf);
        assert_eq!(Watermark::read(&buf), Watermark::new(5, 0));
    }
}
