//! Single-shot PNG compression.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, instrument, warn};

use crate::cancel::{CancelToken, StopReason, Watchdog};
use crate::engine::LiqQuantizer;
use crate::native::{NativeError, OutputGuard, Quantizer};
use crate::options::QuantizeOptions;
use crate::{CompressError, Result};

/// A quantized PNG held in memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedImage {
    data: Vec<u8>,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Quality (0-100) the quantizer reports it achieved
    pub quality: Option<u8>,
}

impl CompressedImage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write the image to `path`, replacing any existing file.
    ///
    /// The bytes go to a temporary file next to `path` which is renamed over
    /// it once fully written, so `path` either keeps its old contents or
    /// holds the complete image. The temporary file is removed on failure.
    #[instrument(skip_all, fields(path = %path.as_ref().display(), len = self.data.len()))]
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let persist_err = |source| CompressError::Persist {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut builder = tempfile::Builder::new();
        builder.prefix(".pngkit-");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // tempfile defaults to 0600; leave the mode to the umask like File::create
            builder.permissions(fs::Permissions::from_mode(0o666));
        }
        let mut staged = builder.tempfile_in(dir).map_err(persist_err)?;
        staged
            .write_all(&self.data)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(persist_err)?;
        debug!(staged = %staged.path().display(), "staged");

        staged.persist(path).map_err(|err| {
            warn!(error = %err.error, "could not move staged output into place");
            persist_err(err.error)
        })?;
        debug!("persisted");
        Ok(())
    }
}

impl AsRef<[u8]> for CompressedImage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<StopReason> for CompressError {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Cancelled => CompressError::Cancelled,
            StopReason::TimedOut => CompressError::TimedOut,
        }
    }
}

/// Runs a [`Quantizer`] once per call and hands back an owned result.
///
/// # Example
/// ```ignore
/// use pngkit::{Compressor, QuantizeOptions};
///
/// let compressor = Compressor::new();
/// let image = compressor.compress(&std::fs::read("in.png")?, &QuantizeOptions::default())?;
/// image.persist("out.png")?;
/// ```
pub struct Compressor<Q: Quantizer = LiqQuantizer> {
    quantizer: Q,
    serial: Mutex<()>,
}

impl Compressor {
    pub fn new() -> Self {
        Self::with_quantizer(LiqQuantizer)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: Quantizer> Compressor<Q> {
    pub fn with_quantizer(quantizer: Q) -> Self {
        Self {
            quantizer,
            serial: Mutex::new(()),
        }
    }

    pub fn quantizer(&self) -> &Q {
        &self.quantizer
    }

    /// Quantize `source`, an encoded PNG, into a palette PNG.
    #[must_use = "this returns the compressed image"]
    pub fn compress(&self, source: &[u8], options: &QuantizeOptions) -> Result<CompressedImage> {
        self.compress_with_cancel(source, options, &CancelToken::new())
    }

    /// Like [`compress`](Self::compress), stopping early once `cancel` is
    /// triggered or `options.timeout` elapses.
    #[instrument(skip_all, fields(source_len = source.len()))]
    pub fn compress_with_cancel(
        &self,
        source: &[u8],
        options: &QuantizeOptions,
        cancel: &CancelToken,
    ) -> Result<CompressedImage> {
        if source.is_empty() {
            return Err(CompressError::EmptyInput);
        }
        options.validate()?;

        let params = options.to_params();
        let watchdog = Watchdog::new(cancel.clone(), options.timeout);
        if let Some(reason) = watchdog.check() {
            return Err(reason.into());
        }

        let (data, reported, (width, height), quality) = {
            let _serial = self.serialize();
            let output = self
                .quantizer
                .quantize(source, &params, &watchdog)
                .map_err(|err| stop_reason_or(err, &watchdog))?;

            let guard = OutputGuard::new(&self.quantizer, output);
            let data = guard.copy_out();
            (data, guard.reported_len(), guard.dimensions(), guard.quality())
        };

        if data.len() != reported {
            warn!(reported, copied = data.len(), "output length mismatch");
            return Err(CompressError::Transform {
                reported,
                copied: data.len(),
            });
        }

        debug!(
            output_len = data.len(),
            width,
            height,
            ?quality,
            "compressed"
        );
        Ok(CompressedImage {
            data,
            width,
            height,
            quality,
        })
    }

    /// Read all of `reader` and compress it.
    pub fn compress_reader<R: Read>(
        &self,
        mut reader: R,
        options: &QuantizeOptions,
    ) -> Result<CompressedImage> {
        let mut source = Vec::new();
        reader
            .read_to_end(&mut source)
            .map_err(CompressError::Read)?;
        self.compress(&source, options)
    }

    /// Compress the PNG at `input` and write the result to `output`.
    #[instrument(skip_all, fields(input = %input.as_ref().display(), output = %output.as_ref().display()))]
    pub fn compress_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        options: &QuantizeOptions,
    ) -> Result<CompressedImage> {
        let source = fs::read(input.as_ref()).map_err(CompressError::Read)?;
        let image = self.compress(&source, options)?;
        image.persist(output.as_ref())?;
        Ok(image)
    }

    fn serialize(&self) -> Option<MutexGuard<'_, ()>> {
        if self.quantizer.is_reentrant() {
            None
        } else {
            Some(self.serial.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }
}

/// An abort caused by the watchdog is reported as cancellation or timeout.
fn stop_reason_or(err: NativeError, watchdog: &Watchdog) -> CompressError {
    match (&err, watchdog.check()) {
        (NativeError::Aborted, Some(reason)) => reason.into(),
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeOutput;
    use crate::options::QuantizeParams;
    use crate::PNG_SIGNATURE;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// What the fake quantizer should do on each call.
    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        MisreportLength,
        Fail,
        WaitForStop,
    }

    struct FakeQuantizer {
        behavior: Behavior,
        reentrant: bool,
        calls: AtomicUsize,
        released: AtomicUsize,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
    }

    impl FakeQuantizer {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                reentrant: true,
                calls: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl Quantizer for FakeQuantizer {
        fn quantize(
            &self,
            source: &[u8],
            _params: &QuantizeParams,
            watchdog: &Watchdog,
        ) -> core::result::Result<NativeOutput, NativeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            self.in_flight.store(false, Ordering::SeqCst);

            let mut data = PNG_SIGNATURE.to_vec();
            data.extend_from_slice(source);
            match self.behavior {
                Behavior::Succeed => Ok(NativeOutput::new(data, 3, 2).with_quality(Some(87))),
                Behavior::MisreportLength => {
                    let len = data.len() + 5;
                    Ok(NativeOutput::new(data, 3, 2).with_reported_len(len))
                }
                Behavior::Fail => Err(NativeError::Quantize(imagequant::Error::QualityTooLow)),
                Behavior::WaitForStop => {
                    while !watchdog.should_stop() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(NativeError::Aborted)
                }
            }
        }

        fn release(&self, _output: NativeOutput) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn is_reentrant(&self) -> bool {
            self.reentrant
        }
    }

    #[test]
    fn test_compress_copies_and_releases() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::Succeed));
        let image = compressor
            .compress(b"abc", &QuantizeOptions::default())
            .unwrap();

        assert!(image.as_bytes().starts_with(&PNG_SIGNATURE));
        assert_eq!(&image.as_bytes()[8..], b"abc");
        assert_eq!((image.width, image.height), (3, 2));
        assert_eq!(image.quality, Some(87));
        assert_eq!(compressor.quantizer().calls(), 1);
        assert_eq!(compressor.quantizer().released(), 1);
    }

    #[test]
    fn test_empty_input_never_reaches_quantizer() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::Succeed));
        let result = compressor.compress(&[], &QuantizeOptions::default());
        assert!(matches!(result, Err(CompressError::EmptyInput)));
        assert_eq!(compressor.quantizer().calls(), 0);
    }

    #[test]
    fn test_invalid_quality_never_reaches_quantizer() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::Succeed));
        let opts = QuantizeOptions {
            min_quality: 80,
            max_quality: 20,
            ..QuantizeOptions::default()
        };
        let result = compressor.compress(b"abc", &opts);
        assert!(matches!(
            result,
            Err(CompressError::InvalidParameter {
                name: "min_quality",
                ..
            })
        ));
        assert_eq!(compressor.quantizer().calls(), 0);
        assert_eq!(compressor.quantizer().released(), 0);
    }

    #[test]
    fn test_length_mismatch_is_rejected_after_release() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::MisreportLength));
        let result = compressor.compress(b"abc", &QuantizeOptions::default());
        match result {
            Err(CompressError::Transform { reported, copied }) => {
                assert_eq!(copied, 11);
                assert_eq!(reported, 16);
            }
            other => panic!("expected Transform, got {other:?}"),
        }
        assert_eq!(compressor.quantizer().released(), 1);
    }

    #[test]
    fn test_native_failure_is_propagated() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::Fail));
        let result = compressor.compress(b"abc", &QuantizeOptions::default());
        assert!(matches!(
            result,
            Err(CompressError::Native(NativeError::Quantize(
                imagequant::Error::QualityTooLow
            )))
        ));
        assert_eq!(compressor.quantizer().calls(), 1);
        assert_eq!(compressor.quantizer().released(), 0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::Succeed));
        let token = CancelToken::new();
        token.cancel();
        let result = compressor.compress_with_cancel(b"abc", &QuantizeOptions::default(), &token);
        assert!(matches!(result, Err(CompressError::Cancelled)));
        assert_eq!(compressor.quantizer().calls(), 0);
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::WaitForStop));
        let token = CancelToken::new();
        let result = std::thread::scope(|s| {
            let canceller = token.clone();
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                canceller.cancel();
            });
            compressor.compress_with_cancel(b"abc", &QuantizeOptions::default(), &token)
        });
        assert!(matches!(result, Err(CompressError::Cancelled)));
    }

    #[test]
    fn test_timeout() {
        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::WaitForStop));
        let opts = QuantizeOptions {
            timeout: Some(Duration::from_millis(10)),
            ..QuantizeOptions::default()
        };
        let result = compressor.compress(b"abc", &opts);
        assert!(matches!(result, Err(CompressError::TimedOut)));
    }

    #[test]
    fn test_non_reentrant_quantizer_is_serialized() {
        let mut fake = FakeQuantizer::new(Behavior::Succeed);
        fake.reentrant = false;
        let compressor = Compressor::with_quantizer(fake);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..4 {
                        compressor
                            .compress(b"abc", &QuantizeOptions::default())
                            .unwrap();
                    }
                });
            }
        });

        let fake = compressor.quantizer();
        assert!(!fake.overlapped.load(Ordering::SeqCst));
        assert_eq!(fake.calls(), 32);
        assert_eq!(fake.released(), 32);
    }

    #[test]
    fn test_compress_reader_surfaces_read_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk on fire"))
            }
        }

        let compressor = Compressor::with_quantizer(FakeQuantizer::new(Behavior::Succeed));
        let result = compressor.compress_reader(Broken, &QuantizeOptions::default());
        assert!(matches!(result, Err(CompressError::Read(_))));
        assert_eq!(compressor.quantizer().calls(), 0);
    }
}
