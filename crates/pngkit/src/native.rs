//! The quantizer boundary.
//!
//! A [`Quantizer`] takes an encoded PNG and hands back a [`NativeOutput`]
//! that the caller owns until it gives it back through
//! [`Quantizer::release`]. [`OutputGuard`] ties that hand-back to scope so
//! the buffer is released exactly once on every exit path.

use thiserror::Error;

use crate::cancel::Watchdog;
use crate::options::QuantizeParams;

/// Failures reported by the quantizer itself.
#[derive(Debug, Error)]
pub enum NativeError {
    /// The source is not a readable PNG
    #[error("decoding failed: {0}")]
    Decode(#[from] png::DecodingError),

    /// Palette selection or remapping failed
    #[error("imagequant: {0}")]
    Quantize(#[from] imagequant::Error),

    /// Writing the indexed PNG failed
    #[error("encoding failed: {0}")]
    Encode(#[from] png::EncodingError),

    /// The lossless rezip pass failed
    #[error("recompression failed: {0}")]
    Optimize(#[from] oxipng::PngError),

    /// Decoded pixel data does not have a layout the quantizer accepts
    #[error("unsupported pixel layout: {0}")]
    UnsupportedLayout(String),

    /// The result is not small enough to be worth keeping
    #[error("result of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    /// Stopped early by the progress callback
    #[error("aborted")]
    Aborted,
}

/// A buffer produced by a [`Quantizer`] together with what it reported
/// about it.
#[derive(Debug)]
pub struct NativeOutput {
    data: Box<[u8]>,
    reported_len: usize,
    width: u32,
    height: u32,
    quality: Option<u8>,
}

impl NativeOutput {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        let data = data.into_boxed_slice();
        Self {
            reported_len: data.len(),
            data,
            width,
            height,
            quality: None,
        }
    }

    /// Override the reported length, for quantizers that report it
    /// separately from the buffer.
    pub fn with_reported_len(mut self, len: usize) -> Self {
        self.reported_len = len;
        self
    }

    pub fn with_quality(mut self, quality: Option<u8>) -> Self {
        self.quality = quality;
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn reported_len(&self) -> usize {
        self.reported_len
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn quality(&self) -> Option<u8> {
        self.quality
    }
}

/// Something that turns an encoded PNG into a quantized, encoded PNG.
pub trait Quantizer {
    /// Run one blocking, single-shot quantization of `source`.
    ///
    /// Implementations should poll `watchdog` and return
    /// [`NativeError::Aborted`] once it fires.
    fn quantize(
        &self,
        source: &[u8],
        params: &QuantizeParams,
        watchdog: &Watchdog,
    ) -> Result<NativeOutput, NativeError>;

    /// Take back a buffer previously returned by [`quantize`](Self::quantize).
    fn release(&self, output: NativeOutput) {
        drop(output);
    }

    /// Whether concurrent `quantize` calls on the same instance are safe.
    /// Callers serialize access when this is `false`.
    fn is_reentrant(&self) -> bool {
        true
    }
}

/// Scoped ownership of a [`NativeOutput`].
///
/// Dropping the guard hands the buffer back to the quantizer that produced it.
pub struct OutputGuard<'q, Q: Quantizer + ?Sized> {
    quantizer: &'q Q,
    output: Option<NativeOutput>,
}

impl<'q, Q: Quantizer + ?Sized> OutputGuard<'q, Q> {
    pub fn new(quantizer: &'q Q, output: NativeOutput) -> Self {
        Self {
            quantizer,
            output: Some(output),
        }
    }

    fn output(&self) -> &NativeOutput {
        // Only `Drop` takes the output.
        match &self.output {
            Some(output) => output,
            None => unreachable!("output guard used after release"),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.output().bytes()
    }

    pub fn reported_len(&self) -> usize {
        self.output().reported_len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let output = self.output();
        (output.width(), output.height())
    }

    pub fn quality(&self) -> Option<u8> {
        self.output().quality()
    }

    /// Copy the buffer into caller-owned memory.
    pub fn copy_out(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }
}

impl<Q: Quantizer + ?Sized> Drop for OutputGuard<'_, Q> {
    fn drop(&mut self) {
        if let Some(output) = self.output.take() {
            self.quantizer.release(output);
        }
    }
}
