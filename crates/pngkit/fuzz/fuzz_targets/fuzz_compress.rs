#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pngkit::{Compressor, QuantizeOptions};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    source: Vec<u8>,
    min_quality: u8,
    max_quality: u8,
    dither: f32,
    speed: u8,
    compression_level: u8,
}

fuzz_target!(|input: FuzzInput| {
    let opts = QuantizeOptions {
        min_quality: input.min_quality,
        max_quality: input.max_quality,
        dither: input.dither,
        speed: input.speed,
        // Keep the rezip pass cheap
        compression_level: input.compression_level % 3,
        ..QuantizeOptions::default()
    };

    // Arbitrary bytes and parameters must produce an error, never a panic
    let _ = Compressor::new().compress(&input.source, &opts);
});
