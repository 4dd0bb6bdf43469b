//! Fixed-shape sample matrices as written by the capture program.
//!
//! An artifact is a raw dump of native-endian `i16`s, row-major, 8 rows of 16384 samples.
//! Anything that isn't exactly that many bytes is rejected.

use std::{fs::File, io::Read, path::Path};

use byte_slice_cast::{AsByteSlice, AsMutByteSlice};

use crate::{Error, Result, ARTIFACT_BYTES, ARTIFACT_LEN, ROWS, SAMPLES};

#[derive(Clone, PartialEq, Eq)]
pub struct SampleMatrix {
    samples: Vec<i16>,
}

impl std::fmt::Debug for SampleMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleMatrix")
            .field("shape", &self.shape())
            .finish()
    }
}

impl Default for SampleMatrix {
    fn default() -> Self {
        Self {
            samples: vec![0; ARTIFACT_LEN],
        }
    }
}

impl SampleMatrix {
    /// Wrap a flat row-major buffer, `None` if it isn't exactly `ROWS * SAMPLES` long
    pub fn from_samples(samples: Vec<i16>) -> Option<Self> {
        (samples.len() == ARTIFACT_LEN).then_some(Self { samples })
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ARTIFACT_BYTES {
            return None;
        }
        let mut matrix = Self::default();
        matrix.samples.as_mut_byte_slice().copy_from_slice(bytes);
        Some(matrix)
    }

    /// Read and decode a capture artifact
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len != ARTIFACT_BYTES as u64 {
            return Err(Error::Decode {
                path: path.to_owned(),
                len,
            });
        }
        let mut matrix = Self::default();
        file.read_exact(matrix.samples.as_mut_byte_slice())?;
        Ok(matrix)
    }

    pub fn shape(&self) -> (usize, usize) {
        (ROWS, SAMPLES)
    }

    pub fn channel(&self, row: usize) -> &[i16] {
        &self.samples[row * SAMPLES..(row + 1) * SAMPLES]
    }

    pub fn channel_mut(&mut self, row: usize) -> &mut [i16] {
        &mut self.samples[row * SAMPLES..(row + 1) * SAMPLES]
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.samples.as_byte_slice()
    }
}
