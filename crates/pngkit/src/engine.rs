//! Default quantizer: imagequant for the palette, `png` for the container,
//! oxipng for the optional rezip pass.

use std::borrow::Cow;

use imagequant::{Attributes, ControlFlow, RGBA};
use png::text_metadata::{ITXtChunk, TEXtChunk, ZTXtChunk};
use tracing::{debug, instrument};

use crate::cancel::Watchdog;
use crate::native::{NativeError, NativeOutput, Quantizer};
use crate::options::QuantizeParams;
use crate::{CompressError, Result};

/// Gamma written to every output. PNG can't store exactly 1/2.2.
pub const OUTPUT_GAMMA: f64 = 0.45455;

/// Quality assumed for the size limit when the quantizer doesn't report one.
const FALLBACK_QUALITY: u8 = 90;

/// A decoded PNG as RGBA8.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedImage {
    /// Pixel data, 4 bytes per pixel (R, G, B, A)
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Source gamma from the gAMA chunk, if present
    pub gamma: Option<f64>,
}

/// Decode a PNG into RGBA8 pixels.
///
/// Palette, grayscale and tRNS transparency are expanded and 16-bit
/// channels are stripped to 8 bits.
pub fn decode(source: &[u8]) -> Result<DecodedImage> {
    if source.is_empty() {
        return Err(CompressError::EmptyInput);
    }
    let (image, _) = decode_rgba(source)?;
    Ok(image)
}

/// Ancillary chunks copied from the source into the quantized output.
#[derive(Clone, Debug, Default)]
struct SourceMetadata {
    pixel_dims: Option<png::PixelDimensions>,
    srgb: Option<png::SrgbRenderingIntent>,
    icc_profile: Option<Vec<u8>>,
    exif: Option<Vec<u8>>,
    latin1_text: Vec<TEXtChunk>,
    compressed_text: Vec<ZTXtChunk>,
    utf8_text: Vec<ITXtChunk>,
}

impl SourceMetadata {
    fn from_info(info: &png::Info<'_>) -> Self {
        Self {
            pixel_dims: info.pixel_dims,
            srgb: info.srgb,
            icc_profile: info.icc_profile.as_ref().map(|p| p.to_vec()),
            exif: info.exif_metadata.as_ref().map(|e| e.to_vec()),
            latin1_text: info.uncompressed_latin1_text.clone(),
            compressed_text: info.compressed_latin1_text.clone(),
            utf8_text: info.utf8_text.clone(),
        }
    }
}

fn decode_rgba(
    source: &[u8],
) -> core::result::Result<(DecodedImage, SourceMetadata), NativeError> {
    let mut decoder = png::Decoder::new(source);
    decoder.set_transformations(
        png::Transformations::normalize_to_color8() | png::Transformations::ALPHA,
    );
    let mut reader = decoder.read_info()?;
    let gamma = reader
        .info()
        .source_gamma
        .map(|g| f64::from(g.into_value()));

    let mut buf = vec![0; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut buf)?;
    buf.truncate(frame.buffer_size());
    // chunks before IDAT only; trailing text is not read
    let metadata = SourceMetadata::from_info(reader.info());

    if frame.bit_depth != png::BitDepth::Eight {
        return Err(NativeError::UnsupportedLayout(format!(
            "{:?} bit depth after normalization",
            frame.bit_depth
        )));
    }

    let pixels = match frame.color_type {
        png::ColorType::Rgba => buf,
        png::ColorType::Rgb => buf
            .chunks_exact(3)
            .flat_map(|c| [c[0], c[1], c[2], 255])
            .collect(),
        png::ColorType::GrayscaleAlpha => buf
            .chunks_exact(2)
            .flat_map(|c| [c[0], c[0], c[0], c[1]])
            .collect(),
        png::ColorType::Grayscale => buf.iter().flat_map(|&g| [g, g, g, 255]).collect(),
        png::ColorType::Indexed => {
            return Err(NativeError::UnsupportedLayout(
                "palette was not expanded".to_string(),
            ))
        }
    };

    let expected = frame.width as usize * frame.height as usize * 4;
    if pixels.len() != expected {
        return Err(NativeError::UnsupportedLayout(format!(
            "expected {expected} bytes of RGBA, got {}",
            pixels.len()
        )));
    }

    let image = DecodedImage {
        pixels,
        width: frame.width,
        height: frame.height,
        gamma,
    };
    Ok((image, metadata))
}

/// The default [`Quantizer`], backed by imagequant.
///
/// Stateless and reentrant: every call builds its own attributes, image
/// and output buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiqQuantizer;

impl LiqQuantizer {
    pub fn new() -> Self {
        Self
    }
}

impl Quantizer for LiqQuantizer {
    #[instrument(skip_all, fields(source_len = source.len(), speed = params.speed))]
    fn quantize(
        &self,
        source: &[u8],
        params: &QuantizeParams,
        watchdog: &Watchdog,
    ) -> core::result::Result<NativeOutput, NativeError> {
        let (decoded, metadata) = decode_rgba(source)?;
        stop_if_fired(watchdog)?;
        debug!(
            width = decoded.width,
            height = decoded.height,
            gamma = ?decoded.gamma,
            "decoded source"
        );

        let width = decoded.width as usize;
        let height = decoded.height as usize;
        let pixels: Vec<RGBA> = decoded
            .pixels
            .chunks_exact(4)
            .map(|c| RGBA::new(c[0], c[1], c[2], c[3]))
            .collect();

        let mut attr = Attributes::new();
        attr.set_speed(i32::from(params.speed))?;
        attr.set_quality(params.min_quality, params.max_quality)?;
        attr.set_progress_callback(progress_callback(watchdog));

        // imagequant takes 0.0 as "assume sRGB"
        let gamma = decoded
            .gamma
            .filter(|g| *g > 0.0 && *g < 1.0)
            .unwrap_or(0.0);
        let mut image = attr.new_image(pixels, width, height, gamma)?;

        let mut result = attr.quantize(&mut image).map_err(lift)?;
        result.set_progress_callback(progress_callback(watchdog));
        result.set_output_gamma(OUTPUT_GAMMA)?;
        result.set_dithering_level(params.dither)?;

        let (palette, indices) = result.remapped(&mut image).map_err(lift)?;
        let quality = result.quantization_quality();
        stop_if_fired(watchdog)?;
        debug!(colors = palette.len(), ?quality, "remapped");

        let mut encoded = write_indexed(
            &palette,
            &indices,
            decoded.width,
            decoded.height,
            params.fast_compression,
            metadata,
        )?;
        stop_if_fired(watchdog)?;

        if params.compression_level > 0 {
            let before = encoded.len();
            encoded = rezip(&encoded, params.compression_level, watchdog)?;
            debug!(before, after = encoded.len(), "rezipped");
        }

        if params.skip_if_larger {
            let limit = size_limit(source.len(), quality.unwrap_or(FALLBACK_QUALITY));
            if encoded.len() > limit {
                return Err(NativeError::TooLarge {
                    size: encoded.len(),
                    limit,
                });
            }
        }

        Ok(NativeOutput::new(encoded, decoded.width, decoded.height).with_quality(quality))
    }
}

fn progress_callback(watchdog: &Watchdog) -> impl Fn(f32) -> ControlFlow + Send + Sync + 'static {
    let watchdog = watchdog.clone();
    move |_percent| {
        if watchdog.should_stop() {
            ControlFlow::Break
        } else {
            ControlFlow::Continue
        }
    }
}

fn stop_if_fired(watchdog: &Watchdog) -> core::result::Result<(), NativeError> {
    if watchdog.should_stop() {
        Err(NativeError::Aborted)
    } else {
        Ok(())
    }
}

fn lift(err: imagequant::Error) -> NativeError {
    if matches!(err, imagequant::Error::Aborted) {
        NativeError::Aborted
    } else {
        NativeError::Quantize(err)
    }
}

/// Largest acceptable output: lose no more quality than is gained in size.
/// Quality is squared so big quality losses need even bigger savings.
fn size_limit(source_len: usize, quality: u8) -> usize {
    let q = f64::from(quality) / 100.0;
    (source_len.saturating_sub(1) as f64 * q * q) as usize
}

fn write_indexed(
    palette: &[RGBA],
    indices: &[u8],
    width: u32,
    height: u32,
    fast: bool,
    metadata: SourceMetadata,
) -> core::result::Result<Vec<u8>, NativeError> {
    let mut info = png::Info::with_size(width, height);
    info.color_type = png::ColorType::Indexed;
    info.bit_depth = png::BitDepth::Eight;
    info.compression = if fast {
        png::Compression::Fast
    } else {
        png::Compression::Best
    };
    // with sRGB present, gAMA is still written because OUTPUT_GAMMA is the sRGB substitute
    info.source_gamma = Some(png::ScaledFloat::from_scaled(
        (OUTPUT_GAMMA * 100_000.0).round() as u32,
    ));
    info.pixel_dims = metadata.pixel_dims;
    info.srgb = metadata.srgb;
    if metadata.srgb.is_none() {
        info.icc_profile = metadata.icc_profile.map(Cow::Owned);
    }
    info.exif_metadata = metadata.exif.map(Cow::Owned);
    info.uncompressed_latin1_text = metadata.latin1_text;
    info.compressed_latin1_text = metadata.compressed_text;
    info.utf8_text = metadata.utf8_text;

    let plte: Vec<u8> = palette.iter().flat_map(|c| [c.r, c.g, c.b]).collect();
    info.palette = Some(Cow::Owned(plte));

    // tRNS stops at the last translucent entry
    let trns_len = palette.iter().rposition(|c| c.a < 255).map_or(0, |i| i + 1);
    if trns_len > 0 {
        let trns: Vec<u8> = palette[..trns_len].iter().map(|c| c.a).collect();
        info.trns = Some(Cow::Owned(trns));
    }

    let mut out = Vec::new();
    {
        let encoder = png::Encoder::with_info(&mut out, info)?;
        let mut writer = encoder.write_header()?;
        writer.write_image_data(indices)?;
        writer.finish()?;
    }
    Ok(out)
}

fn rezip(
    encoded: &[u8],
    level: u8,
    watchdog: &Watchdog,
) -> core::result::Result<Vec<u8>, NativeError> {
    let mut opts = oxipng::Options::from_preset(level);
    // keep gAMA, pHYs, color and text chunks from write_indexed
    opts.strip = oxipng::StripChunks::None;
    opts.timeout = watchdog.remaining();
    let rezipped = oxipng::optimize_from_memory(encoded, &opts)?;
    // oxipng hands back its best attempt so far once its timeout elapses
    stop_if_fired(watchdog)?;
    Ok(rezipped)
}
