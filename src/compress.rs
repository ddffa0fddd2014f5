//! # Compressor Plug-in Interface
//!
//! Databases can register a [`Compressor`] that is applied to record blobs
//! on their way to disk and reversed on the way back. The interface is the
//! open extension point of the engine: implementations live outside the
//! crate; a small run-length coder ships in-tree as the reference
//! implementation and test vehicle.
//!
//! The second input of [`Compressor::compress`] lets callers compress two
//! adjacent buffers in one stream (a key and its record, for instance)
//! without concatenating them first.

use eyre::{ensure, Result};

pub trait Compressor: Send + Sync {
    /// Upper bound of the compressed size for `len` input bytes, used to
    /// pre-size output buffers.
    fn compressed_bound(&self, len: usize) -> usize;

    /// Compresses `in1`, immediately followed by `in2` when given.
    fn compress(&self, in1: &[u8], in2: Option<&[u8]>) -> Result<Vec<u8>>;

    /// Decompresses `input` into exactly `expected_len` bytes.
    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

/// Byte-oriented run-length coding: `(count, byte)` pairs. Wins on records
/// with long runs, loses at most 2x on incompressible input; the engine
/// stores the original bytes whenever compression does not shrink them.
#[derive(Debug, Default, Clone, Copy)]
pub struct RleCompressor;

impl Compressor for RleCompressor {
    fn compressed_bound(&self, len: usize) -> usize {
        2 * len
    }

    fn compress(&self, in1: &[u8], in2: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.compressed_bound(in1.len()));
        let mut encode = |input: &[u8]| {
            let mut i = 0;
            while i < input.len() {
                let byte = input[i];
                let mut run = 1usize;
                while i + run < input.len() && input[i + run] == byte && run < 255 {
                    run += 1;
                }
                out.push(run as u8);
                out.push(byte);
                i += run;
            }
        };
        encode(in1);
        if let Some(in2) = in2 {
            encode(in2);
        }
        Ok(out)
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        ensure!(
            input.len() % 2 == 0,
            "run-length stream of {} bytes is not pair-aligned",
            input.len()
        );
        let mut out = Vec::with_capacity(expected_len);
        for pair in input.chunks_exact(2) {
            out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        ensure!(
            out.len() == expected_len,
            "run-length stream decoded to {} bytes, expected {}",
            out.len(),
            expected_len
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_compressible_data() {
        let rle = RleCompressor;
        let input = [vec![0u8; 300], vec![7u8; 5], vec![1u8; 100]].concat();

        let compressed = rle.compress(&input, None).unwrap();
        assert!(compressed.len() < input.len());
        assert!(compressed.len() <= rle.compressed_bound(input.len()));

        let restored = rle.decompress(&compressed, input.len()).unwrap();
        assert_eq!(restored, input);
    }

    #[test]
    fn two_input_compress_concatenates() {
        let rle = RleCompressor;
        let compressed = rle.compress(&[9u8; 10], Some(&[4u8; 6])).unwrap();
        let restored = rle.decompress(&compressed, 16).unwrap();
        assert_eq!(restored, [vec![9u8; 10], vec![4u8; 6]].concat());
    }

    #[test]
    fn decompress_rejects_wrong_length() {
        let rle = RleCompressor;
        let compressed = rle.compress(&[1, 1, 1], None).unwrap();
        assert!(rle.decompress(&compressed, 99).is_err());
        assert!(rle.decompress(&[1], 1).is_err());
    }
}
