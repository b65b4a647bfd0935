//! Quantization parameters and their validation.

use std::time::Duration;

use crate::{CompressError, Result};

/// Highest `speed` value. 11 behaves like 10 with dithering turned off.
pub const MAX_SPEED: u8 = 11;

/// Highest oxipng preset accepted for `compression_level`.
pub const MAX_COMPRESSION_LEVEL: u8 = 6;

/// Options passed to [`Compressor::compress`](crate::Compressor::compress).
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizeOptions {
    /// Minimum acceptable quality (0-100).
    ///
    /// If the quantizer cannot reach it, compression fails instead of
    /// producing a worse image.
    pub min_quality: u8,

    /// Target quality (0-100, must be >= `min_quality`).
    ///
    /// Values below 100 let the quantizer use fewer colors than 256.
    pub max_quality: u8,

    /// Floyd–Steinberg dithering level (0.0 = none, 1.0 = full).
    pub dither: f32,

    /// Palette search effort (1-11). 1 is slowest and best, 10 is fastest.
    ///
    /// - **1-9**: regular deflate for the indexed PNG
    /// - **10**: fast deflate
    /// - **11**: fast deflate and no dithering
    pub speed: u8,

    /// Lossless recompression preset applied after encoding (0-6).
    /// 0 skips the pass entirely.
    pub compression_level: u8,

    /// Reject results that are not sufficiently smaller than the source.
    pub skip_if_larger: bool,

    /// Abort the call once this much time has passed.
    pub timeout: Option<Duration>,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            min_quality: 0,
            max_quality: 100,
            dither: 1.0,
            speed: 4,
            compression_level: 0,
            skip_if_larger: false,
            timeout: None,
        }
    }
}

impl QuantizeOptions {
    /// Check every field against its accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.max_quality > 100 {
            return Err(invalid("max_quality", format!("{} exceeds 100", self.max_quality)));
        }
        if self.min_quality > self.max_quality {
            return Err(invalid(
                "min_quality",
                format!(
                    "{} is greater than max_quality {}",
                    self.min_quality, self.max_quality
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.dither) {
            return Err(invalid("dither", format!("{} is outside 0.0..=1.0", self.dither)));
        }
        if !(1..=MAX_SPEED).contains(&self.speed) {
            return Err(invalid("speed", format!("{} is outside 1..={MAX_SPEED}", self.speed)));
        }
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(invalid(
                "compression_level",
                format!("{} exceeds {MAX_COMPRESSION_LEVEL}", self.compression_level),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(invalid("timeout", "must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Resolve the options into the values handed to the quantizer.
    ///
    /// Assumes [`validate`](Self::validate) has passed.
    pub fn to_params(&self) -> QuantizeParams {
        let fast_compression = self.speed >= 10;
        let (speed, dither) = if self.speed == MAX_SPEED {
            (10, 0.0)
        } else {
            (self.speed, self.dither)
        };
        QuantizeParams {
            min_quality: self.min_quality,
            max_quality: self.max_quality,
            dither,
            speed,
            fast_compression,
            compression_level: self.compression_level,
            skip_if_larger: self.skip_if_larger,
        }
    }
}

/// Resolved parameters as the quantizer sees them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantizeParams {
    pub min_quality: u8,
    pub max_quality: u8,
    pub dither: f32,
    /// Always within 1..=10.
    pub speed: u8,
    pub fast_compression: bool,
    pub compression_level: u8,
    pub skip_if_larger: bool,
}

fn invalid(name: &'static str, reason: String) -> CompressError {
    CompressError::InvalidParameter { name, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(f: impl FnOnce(&mut QuantizeOptions)) -> QuantizeOptions {
        let mut opts = QuantizeOptions::default();
        f(&mut opts);
        opts
    }

    #[test]
    fn test_default_is_valid() {
        assert!(QuantizeOptions::default().validate().is_ok());
    }

    #[test]
    fn test_min_above_max() {
        let opts = with(|o| {
            o.min_quality = 90;
            o.max_quality = 50;
        });
        match opts.validate() {
            Err(CompressError::InvalidParameter { name, .. }) => assert_eq!(name, "min_quality"),
            other => panic!("expected InvalidParameter, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_fields() {
        assert!(with(|o| o.max_quality = 101).validate().is_err());
        assert!(with(|o| o.dither = 1.5).validate().is_err());
        assert!(with(|o| o.dither = -0.1).validate().is_err());
        assert!(with(|o| o.dither = f32::NAN).validate().is_err());
        assert!(with(|o| o.speed = 0).validate().is_err());
        assert!(with(|o| o.speed = 12).validate().is_err());
        assert!(with(|o| o.compression_level = 7).validate().is_err());
        assert!(with(|o| o.timeout = Some(Duration::ZERO)).validate().is_err());
    }

    #[test]
    fn test_edges_are_valid() {
        assert!(with(|o| {
            o.min_quality = 100;
            o.max_quality = 100;
        })
        .validate()
        .is_ok());
        assert!(with(|o| o.speed = 1).validate().is_ok());
        assert!(with(|o| o.speed = 11).validate().is_ok());
        assert!(with(|o| o.dither = 0.0).validate().is_ok());
        assert!(with(|o| o.compression_level = 6).validate().is_ok());
    }

    #[test]
    fn test_speed_eleven_disables_dithering() {
        let params = with(|o| o.speed = 11).to_params();
        assert_eq!(params.speed, 10);
        assert_eq!(params.dither, 0.0);
        assert!(params.fast_compression);
    }

    #[test]
    fn test_speed_ten_keeps_dithering() {
        let params = with(|o| {
            o.speed = 10;
            o.dither = 0.5;
        })
        .to_params();
        assert_eq!(params.speed, 10);
        assert_eq!(params.dither, 0.5);
        assert!(params.fast_compression);
    }

    #[test]
    fn test_regular_speed() {
        let params = with(|o| o.speed = 3).to_params();
        assert_eq!(params.speed, 3);
        assert!(!params.fast_compression);
    }
}
