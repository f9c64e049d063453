//! Offline song renderer
//!
//! Renders a song document through the real-time `process` path and writes
//! a 32-bit float stereo WAV. Telemetry is printed to stdout as JSON lines.
//!
//! ```text
//! render-song <song.json> <out.wav> [--seconds N] [--config path]
//! ```
//!
//! Without `--seconds` the whole song is rendered. Set `RUST_LOG=debug` for
//! verbose output.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};

use cadence_core::config::{default_config_path, load_config, EngineConfig};
use cadence_core::{EngineHandle, StereoBuffer};

/// Telemetry events drained per block
const TELEMETRY_BATCH: usize = 256;

struct Args {
    song: PathBuf,
    output: PathBuf,
    seconds: Option<f64>,
    config: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut seconds = None;
    let mut config = default_config_path("engine.yaml");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seconds" => {
                let value = args.next().context("--seconds needs a value")?;
                let parsed: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid --seconds value '{}'", value))?;
                if !(parsed > 0.0) {
                    bail!("--seconds must be positive");
                }
                seconds = Some(parsed);
            }
            "--config" => {
                config = PathBuf::from(args.next().context("--config needs a path")?);
            }
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let [song, output]: [PathBuf; 2] = positional.try_into().map_err(|_| {
        anyhow::anyhow!("Usage: render-song <song.json> <out.wav> [--seconds N] [--config path]")
    })?;
    Ok(Args {
        song,
        output,
        seconds,
        config,
    })
}

fn write_wav(path: &Path, audio: &StereoBuffer, sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {:?}", path))?;
    for &sample in audio.as_interleaved() {
        writer.write_sample(sample)?;
    }
    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    let config: EngineConfig = load_config(&args.config);
    config.validate()?;
    let sample_rate = config.sample_rate;
    let block = config.block_size;

    let json = std::fs::read_to_string(&args.song)
        .with_context(|| format!("Failed to read song {:?}", args.song))?;

    let mut engine = EngineHandle::new(config);
    if !engine.load_song_from_json(&json) {
        bail!("Song {:?} was rejected, see log for details", args.song);
    }
    let duration = engine.controller().map_or(0.0, |c| c.song_duration());
    let seconds = args.seconds.unwrap_or(duration);
    let total_frames = (seconds * sample_rate as f64).ceil() as usize;
    log::info!(
        "Rendering '{}' for {:.2}s ({} frames)",
        engine.current_song_id(),
        seconds,
        total_frames
    );

    engine.play(0.0);
    let mut left = vec![0.0f32; total_frames];
    let mut right = vec![0.0f32; total_frames];
    let mut done = 0;
    while done < total_frames {
        let n = block.min(total_frames - done);
        engine.process(
            &mut [&mut left[done..done + n], &mut right[done..done + n]],
            2,
            n,
        );
        for record in engine.drain_telemetry(TELEMETRY_BATCH) {
            println!("{}", record.to_json_line());
        }
        done += n;
    }

    let audio = StereoBuffer::from_channels(&left, &right);
    write_wav(&args.output, &audio, sample_rate)?;

    let stats = engine.render_stats();
    let counters = engine.counters();
    log::info!(
        "Wrote {:?}: peak {:.3}, position {:.2}s, {} blocks, {} overruns, {} telemetry dropped",
        args.output,
        audio.peak(),
        stats.position,
        counters.blocks_rendered,
        counters.deadline_overruns,
        counters.telemetry_dropped
    );
    Ok(())
}
