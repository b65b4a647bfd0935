//! pngkit - Lossy PNG compression
//!
//! A command-line tool for shrinking PNG files by quantizing them to a palette.

use clap::{Parser, Subcommand};
use pngkit::{Compressor, QuantizeOptions};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pngkit")]
#[command(version)]
#[command(about = "Lossy PNG compression with palette quantization", long_about = None)]
struct Cli {
    /// Log progress to stderr (-vv for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Quantize a PNG and write the smaller result
    Compress {
        /// Input PNG file (use - for stdin)
        input: PathBuf,

        /// Output PNG file (default: input with -fs8.png suffix, or stdout when reading stdin)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Quality range as MIN-MAX or a single MAX (0-100)
        #[arg(short, long, default_value = "0-100", value_parser = parse_quality)]
        quality: (u8, u8),

        /// Dithering level (0.0-1.0)
        #[arg(short, long, default_value = "1.0")]
        dither: f32,

        /// Speed/quality trade-off (1 = slow and best, 11 = fastest, no dithering)
        #[arg(short, long, default_value = "4")]
        speed: u8,

        /// Lossless recompression preset (0 = off, 1-6)
        #[arg(short, long, default_value = "0")]
        level: u8,

        /// Fail instead of writing a result that isn't smaller enough
        #[arg(long)]
        skip_if_larger: bool,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Print the dimensions of a PNG
    Inspect {
        /// Input PNG file (use - for stdin)
        input: PathBuf,
    },
}

fn parse_quality(s: &str) -> Result<(u8, u8), String> {
    let parse = |v: &str| {
        v.trim()
            .parse::<u8>()
            .map_err(|e| format!("invalid quality '{v}': {e}"))
    };
    match s.split_once('-') {
        Some((min, max)) => Ok((parse(min)?, parse(max)?)),
        None => Ok((0, parse(s)?)),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn read_input(input: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if is_stdin(input) {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        Ok(fs::read(input).map_err(|e| format!("Failed to read '{}': {}", input.display(), e))?)
    }
}

fn is_stdin(input: &Path) -> bool {
    input.to_string_lossy() == "-"
}

/// `None` means write to stdout.
fn default_output(input: &Path) -> Result<Option<PathBuf>, String> {
    if is_stdin(input) {
        return Ok(None);
    }
    let stem = input
        .file_stem()
        .ok_or_else(|| format!("can't derive an output name from '{}', use -o", input.display()))?;
    Ok(Some(input.with_file_name(format!(
        "{}-fs8.png",
        stem.to_string_lossy()
    ))))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Compress {
            input,
            output,
            quality: (min_quality, max_quality),
            dither,
            speed,
            level,
            skip_if_larger,
            timeout,
        } => {
            let source = read_input(&input)?;
            let timeout = timeout
                .map(Duration::try_from_secs_f64)
                .transpose()
                .map_err(|e| format!("invalid timeout: {e}"))?;

            let opts = QuantizeOptions {
                min_quality,
                max_quality,
                dither,
                speed,
                compression_level: level,
                skip_if_larger,
                timeout,
            };

            info!(
                input = %input.display(),
                source_len = source.len(),
                min_quality,
                max_quality,
                speed,
                level,
                "compressing"
            );

            let image = Compressor::new().compress(&source, &opts)?;
            let output_path = match output {
                Some(path) => Some(path),
                None => default_output(&input)?,
            };
            let destination = match &output_path {
                Some(path) => {
                    image.persist(path)?;
                    format!("'{}'", path.display())
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    stdout.write_all(image.as_bytes())?;
                    stdout.flush()?;
                    "stdout".to_string()
                }
            };

            eprintln!(
                "Compressed {}x{}: {} -> {} bytes{} -> {}",
                image.width,
                image.height,
                source.len(),
                image.len(),
                image
                    .quality
                    .map(|q| format!(" (quality {q})"))
                    .unwrap_or_default(),
                destination
            );
        }

        Commands::Inspect { input } => {
            let source = read_input(&input)?;
            let decoded = pngkit::decode(&source)?;
            println!("{}x{}", decoded.width, decoded.height);
            if let Some(gamma) = decoded.gamma {
                println!("gamma {gamma:.5}");
            }
        }
    }

    Ok(())
}
