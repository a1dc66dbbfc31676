//! Compression codec for backup artifacts
//!
//! Backup artifacts can be stored gzip, deflate or brotli compressed. The codec
//! is symmetric: for every algorithm and valid level,
//! `decompress(compress(x)) == x`.
//!
//! ## Algorithms
//!
//! | Algorithm | Crate    | Levels | Artifact suffix |
//! |-----------|----------|--------|-----------------|
//! | gzip      | `flate2` | 0-9    | `.gz`           |
//! | deflate   | `flate2` | 0-9    | `.deflate`      |
//! | brotli    | `brotli` | 0-11   | `.br`           |
//!
//! The algorithm is recovered from the artifact suffix on restore, so there is
//! no header of our own in front of the codec stream. gzip carries a CRC32 and
//! therefore reports truncated or altered streams; raw deflate and brotli
//! corruption is caught by the checksum verification that follows every
//! decompression in the backup manager.
//!
//! ## Examples
//!
//! ```rust
//! use backstop::compression::{compress, decompress, CompressionAlgorithm};
//!
//! let data = b"body { margin: 0; }\n".repeat(64);
//! let packed = compress(&data, CompressionAlgorithm::Brotli, 9).unwrap();
//! assert!(packed.len() < data.len());
//! assert_eq!(decompress(&packed, CompressionAlgorithm::Brotli).unwrap(), data);
//! ```

use crate::config::CompressionConfig;
use crate::error::{BackstopError, Result};
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, trace};

/// Brotli window size (log2), the encoder's own default
const BROTLI_LGWIN: i32 = 22;

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// gzip container around deflate, with CRC32
    #[default]
    Gzip,
    /// Raw deflate stream
    Deflate,
    /// Brotli stream
    Brotli,
}

impl CompressionAlgorithm {
    /// All supported algorithms
    pub const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Deflate,
        CompressionAlgorithm::Brotli,
    ];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Deflate => "deflate",
            CompressionAlgorithm::Brotli => "brotli",
        }
    }

    /// Artifact suffix, including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => ".gz",
            CompressionAlgorithm::Deflate => ".deflate",
            CompressionAlgorithm::Brotli => ".br",
        }
    }

    /// Reverse of [`extension`](Self::extension)
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.extension() == ext)
    }

    /// Highest accepted level
    pub fn max_level(&self) -> u32 {
        match self {
            CompressionAlgorithm::Gzip | CompressionAlgorithm::Deflate => 9,
            CompressionAlgorithm::Brotli => 11,
        }
    }

    /// Reject levels outside the algorithm's range
    pub fn validate_level(&self, level: u32) -> Result<()> {
        if level > self.max_level() {
            return Err(BackstopError::config(format!(
                "compression level {} is out of range for {} (0-{})",
                level,
                self.as_str(),
                self.max_level()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "deflate" => Ok(CompressionAlgorithm::Deflate),
            "brotli" | "br" => Ok(CompressionAlgorithm::Brotli),
            other => Err(BackstopError::config(format!(
                "unknown compression algorithm: {}",
                other
            ))),
        }
    }
}

/// Compress `data` with `algorithm` at `level`
///
/// # Errors
///
/// Returns [`BackstopError::InvalidConfiguration`] for an out-of-range level
/// and [`BackstopError::Compression`] if the encoder fails.
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: u32) -> Result<Vec<u8>> {
    algorithm.validate_level(level)?;

    let encoded = match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
            encoder.write_all(data).and_then(|_| encoder.finish())
        }
        CompressionAlgorithm::Deflate => {
            let mut encoder =
                DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
            encoder.write_all(data).and_then(|_| encoder.finish())
        }
        CompressionAlgorithm::Brotli => {
            let mut params = brotli::enc::BrotliEncoderParams::default();
            params.quality = level as i32;
            params.lgwin = BROTLI_LGWIN;
            let mut out = Vec::with_capacity(data.len() / 2);
            brotli::BrotliCompress(&mut &data[..], &mut out, &params).map(|_| out)
        }
    };

    encoded.map_err(|e| BackstopError::compression(format!("{} encoder failed: {}", algorithm, e)))
}

/// Decompress `data` that was produced by [`compress`] with `algorithm`
///
/// # Errors
///
/// Returns [`BackstopError::Decompression`] if the stream is malformed,
/// truncated or (for gzip) fails its CRC check.
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(3));

    let decoded = match algorithm {
        CompressionAlgorithm::Gzip => GzDecoder::new(data).read_to_end(&mut out).map(|_| ()),
        CompressionAlgorithm::Deflate => DeflateDecoder::new(data).read_to_end(&mut out).map(|_| ()),
        CompressionAlgorithm::Brotli => brotli::BrotliDecompress(&mut &data[..], &mut out),
    };

    decoded
        .map(|_| out)
        .map_err(|e| BackstopError::decompression(format!("{} stream is invalid: {}", algorithm, e)))
}

/// Compression statistics for monitoring
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Artifacts written compressed
    pub files_compressed: usize,
    /// Files that fell below the threshold
    pub files_below_threshold: usize,
    /// Uncompressed bytes fed to the encoder
    pub bytes_in: u64,
    /// Compressed bytes produced
    pub bytes_out: u64,
    /// Artifacts decompressed
    pub files_decompressed: usize,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
    /// Total decompression time in milliseconds
    pub decompression_time_ms: u64,
}

impl CompressionStats {
    /// Overall original/stored ratio (higher is better, 1.0 when nothing was compressed)
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            return 1.0;
        }
        self.bytes_in as f64 / self.bytes_out as f64
    }

    /// Bytes saved across all compressed artifacts
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_in.saturating_sub(self.bytes_out)
    }
}

/// Configured codec with running statistics
///
/// Wraps [`compress`]/[`decompress`] with the configured algorithm, level and
/// size threshold. Statistics are behind a short-lived lock, so one engine can
/// be shared by concurrent backups.
#[derive(Debug)]
pub struct CompressionEngine {
    enabled: bool,
    algorithm: CompressionAlgorithm,
    level: u32,
    threshold: u64,
    stats: Mutex<CompressionStats>,
}

impl CompressionEngine {
    /// Create an engine from validated configuration
    pub fn new(config: &CompressionConfig) -> Result<Self> {
        config.algorithm.validate_level(config.level)?;
        Ok(Self {
            enabled: config.enabled,
            algorithm: config.algorithm,
            level: config.level,
            threshold: config.threshold,
            stats: Mutex::new(CompressionStats::default()),
        })
    }

    /// Algorithm used for new artifacts
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Whether a file of `size` bytes should be stored compressed
    pub fn should_compress(&self, size: u64) -> bool {
        if !self.enabled {
            return false;
        }
        let eligible = size >= self.threshold;
        if !eligible {
            self.stats.lock().files_below_threshold += 1;
        }
        eligible
    }

    /// Compress with the configured algorithm and level
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();
        let packed = compress(data, self.algorithm, self.level)?;

        let mut stats = self.stats.lock();
        stats.files_compressed += 1;
        stats.bytes_in += data.len() as u64;
        stats.bytes_out += packed.len() as u64;
        stats.compression_time_ms += start.elapsed().as_millis() as u64;
        drop(stats);

        debug!(
            "Compressed {} -> {} bytes with {} level {}",
            data.len(),
            packed.len(),
            self.algorithm,
            self.level
        );
        Ok(packed)
    }

    /// Decompress an artifact written with `algorithm`
    ///
    /// The algorithm comes from the artifact name, not from this engine's
    /// configuration, so artifacts survive configuration changes.
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
        let start = Instant::now();
        let raw = decompress(data, algorithm)?;

        let mut stats = self.stats.lock();
        stats.files_decompressed += 1;
        stats.decompression_time_ms += start.elapsed().as_millis() as u64;
        drop(stats);

        trace!("Decompressed {} -> {} bytes ({})", data.len(), raw.len(), algorithm);
        Ok(raw)
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> CompressionStats {
        self.stats.lock().clone()
    }
}
