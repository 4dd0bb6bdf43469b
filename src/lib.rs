pub mod alert;
pub mod analysis;
pub mod args;
pub mod capture;
pub mod continuity;
pub mod error;
pub mod matrix;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod store;

pub use error::{Error, Result};

// Set by the ISUM capture firmware
pub const ROWS: usize = 8;
pub const SAMPLES: usize = 16384;
// Elements (not bytes) in one capture artifact
pub const ARTIFACT_LEN: usize = ROWS * SAMPLES;
pub const ARTIFACT_BYTES: usize = ARTIFACT_LEN * std::mem::size_of::<i16>();
// Only the first two rows carry sensor lines we analyze
pub const ANALYZED_CHANNELS: usize = 2;

pub const ARTIFACT_EXTENSION: &str = "bin";
pub const MAX_KEPT: usize = 2;
