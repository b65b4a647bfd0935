//! # pngkit
//!
//! Lossy PNG compression in the style of pngquant: an encoded PNG goes in,
//! a smaller 8-bit palette PNG comes out.
//!
//! ## Features
//!
//! - **Quantization**: palette selection and Floyd–Steinberg dithering via imagequant
//! - **Encoding**: indexed PNG output via the `png` crate
//! - **Recompression**: optional lossless rezip pass via oxipng
//! - **Cancellation**: cooperative cancel token and per-call timeout
//!
//! ## Quick Start
//!
//! ```ignore
//! use pngkit::{Compressor, QuantizeOptions};
//!
//! let source = std::fs::read("head.png")?;
//! let options = QuantizeOptions {
//!     min_quality: 50,
//!     max_quality: 98,
//!     ..QuantizeOptions::default()
//! };
//! let image = Compressor::new().compress(&source, &options)?;
//! image.persist("head-fs8.png")?;
//! ```
//!
//! ### Decoding a PNG to RGBA
//!
//! ```ignore
//! let decoded = pngkit::decode(&std::fs::read("head.png")?)?;
//! println!("{}x{}", decoded.width, decoded.height);
//! ```

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod cancel;
pub mod compressor;
pub mod engine;
pub mod native;
pub mod options;

pub use cancel::{CancelToken, Watchdog};
pub use compressor::{CompressedImage, Compressor};
pub use engine::{decode, DecodedImage, LiqQuantizer};
pub use native::{NativeError, NativeOutput, OutputGuard, Quantizer};
pub use options::{QuantizeOptions, QuantizeParams};

/// The 8-byte signature every PNG file starts with.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Errors that can occur while compressing or decoding a PNG.
#[derive(Debug, Error)]
pub enum CompressError {
    /// The source buffer has zero length
    #[error("empty input")]
    EmptyInput,

    /// Reading the source bytes failed
    #[error("failed to read source: {0}")]
    Read(#[source] io::Error),

    /// A quantization parameter is outside its accepted range
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The quantizer reported a failure
    #[error("quantization failed: {0}")]
    Native(#[from] NativeError),

    /// The copied output does not match the length the quantizer reported
    #[error("output length mismatch: quantizer reported {reported} bytes, copied {copied}")]
    Transform { reported: usize, copied: usize },

    /// Writing the output file failed
    #[error("failed to write '{}': {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The operation was cancelled through its [`CancelToken`]
    #[error("operation cancelled")]
    Cancelled,

    /// The configured timeout elapsed before the operation finished
    #[error("operation timed out")]
    TimedOut,
}

/// Result type for pngkit operations.
pub type Result<T> = core::result::Result<T, CompressError>;
