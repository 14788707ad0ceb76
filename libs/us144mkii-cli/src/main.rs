// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Command-line host for the US-144MKII driver.
//!
//! Drives a streaming session against raw files: packed 24-bit playback
//! (4-channel, or stereo expanded with silent channels 3/4), 32-bit capture
//! dumps, and a hex monitor for inbound MIDI. Intended for bring-up checks
//! and as a reference for the byte-stream contract real audio clients
//! implement.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use us144mkii::{
    CaptureReader, LatencyProfile, MidiReceiver, PlaybackWriter, Session, SessionConfig,
};

const PLAYBACK_FRAME: usize = 12;
const STEREO_FRAME: usize = 6;
const CAPTURE_FRAME: usize = 16;

#[derive(Parser)]
#[command(name = "us144mkii", version, about = "TASCAM US-144MKII user-space driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached supported devices.
    List,
    /// Run a streaming session.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Sample rate in Hz: 44100, 48000, 88200 or 96000.
    #[arg(long, default_value_t = 48_000)]
    rate: u32,

    /// URB fleet shape; lower is less buffering.
    #[arg(long, value_enum, default_value_t = LatencyArg::Normal)]
    latency: LatencyArg,

    /// Play raw audio from this file (packed little-endian 24-bit frames).
    #[arg(long)]
    play_file: Option<PathBuf>,

    /// Treat --play-file as stereo; channels 3 and 4 are zero-filled.
    #[arg(long, requires = "play_file")]
    stereo: bool,

    /// Dump captured audio to this file (4ch little-endian 32-bit frames).
    #[arg(long)]
    capture_file: Option<PathBuf>,

    /// Disable the capture direction entirely.
    #[arg(long, conflicts_with = "capture_file")]
    no_capture: bool,

    /// Print inbound MIDI bytes as hex.
    #[arg(long)]
    midi_monitor: bool,

    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LatencyArg {
    Low,
    Normal,
    High,
}

impl From<LatencyArg> for LatencyProfile {
    fn from(arg: LatencyArg) -> Self {
        match arg {
            LatencyArg::Low => LatencyProfile::Low,
            LatencyArg::Normal => LatencyProfile::Normal,
            LatencyArg::High => LatencyProfile::High,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::List => list(),
        Command::Run(args) => run(args),
    }
}

fn list() -> Result<()> {
    let devices = us144mkii::list_devices().context("device enumeration failed")?;
    if devices.is_empty() {
        println!("no supported devices found");
        return Ok(());
    }
    for device in devices {
        println!(
            "bus {:03} addr {:03}  {:04x}:{:04x}  {}  {}",
            device.bus,
            device.address,
            us144mkii::VENDOR_ID,
            device.product_id,
            device.model,
            device.product.as_deref().unwrap_or("?"),
        );
    }
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let config = SessionConfig {
        sample_rate: args.rate,
        latency: args.latency.into(),
        capture: !args.no_capture,
        midi: true,
    };

    let mut session = Session::open(config).context("session open failed")?;
    session.start().context("session start failed")?;
    tracing::info!(model = session.model(), rate = session.sample_rate(), "streaming");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::Release))
            .context("signal handler installation failed")?;
    }

    let mut workers = Vec::new();

    if let Some(path) = &args.play_file {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let writer = session
            .playback_writer()
            .context("playback writer already taken")?;
        let stop = Arc::clone(&stop);
        let stereo = args.stereo;
        workers.push(thread::spawn(move || play_worker(file, writer, stereo, stop)));
    }

    if let Some(path) = &args.capture_file {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let reader = session.capture_reader().context("capture not configured")?;
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || capture_worker(file, reader, stop)));
    }

    if args.midi_monitor {
        let receiver = session.midi_receiver().context("MIDI not available")?;
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || midi_worker(receiver, stop)));
    }

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut last_report = Instant::now();
    while !stop.load(Ordering::Acquire) && session.is_running() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(Duration::from_millis(50));
        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            let snap = session.snapshot();
            tracing::info!(
                synced = snap.synced,
                warmed_up = snap.warmed_up,
                fill = snap.accumulator_fill,
                feedback = snap.stats.last_feedback_value,
                played = snap.stats.frames_played,
                captured = snap.stats.frames_captured,
                underruns = snap.stats.underruns,
                overruns = snap.stats.overruns,
                sync_losses = snap.stats.sync_losses,
                "session"
            );
        }
    }

    stop.store(true, Ordering::Release);
    for worker in workers {
        let _ = worker.join();
    }
    session.stop();
    Ok(())
}

/// Feed the playback ring from a raw file, expanding stereo frames to the
/// device's four channels when asked. Backpressure is a short sleep; the
/// ring never blocks.
fn play_worker(mut file: File, mut writer: PlaybackWriter, stereo: bool, stop: Arc<AtomicBool>) {
    let mut file_buf = vec![0u8; 4096 * if stereo { STEREO_FRAME } else { PLAYBACK_FRAME }];
    let mut pending: Vec<u8> = Vec::new();

    while !stop.load(Ordering::Acquire) {
        if pending.is_empty() {
            let n = match file.read(&mut file_buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(%err, "playback file read failed");
                    break;
                }
            };
            pending = if stereo {
                expand_stereo(&file_buf[..n - n % STEREO_FRAME])
            } else {
                file_buf[..n - n % PLAYBACK_FRAME].to_vec()
            };
        }

        let written = writer.write(&pending);
        if written == 0 {
            thread::sleep(Duration::from_millis(2));
        } else {
            pending.drain(..written);
        }
    }
    tracing::info!("playback file finished");
}

/// Zero-fill channels 3/4 around a stereo 24-bit stream.
fn expand_stereo(stereo: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; stereo.len() / STEREO_FRAME * PLAYBACK_FRAME];
    for (frame_in, frame_out) in stereo
        .chunks_exact(STEREO_FRAME)
        .zip(out.chunks_exact_mut(PLAYBACK_FRAME))
    {
        frame_out[..STEREO_FRAME].copy_from_slice(frame_in);
    }
    out
}

fn capture_worker(mut file: File, mut reader: CaptureReader, stop: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 4096 * CAPTURE_FRAME];
    while !stop.load(Ordering::Acquire) {
        let n = reader.read(&mut buf);
        if n == 0 {
            thread::sleep(Duration::from_millis(2));
            continue;
        }
        if let Err(err) = file.write_all(&buf[..n]) {
            tracing::error!(%err, "capture file write failed");
            return;
        }
    }
    tracing::info!("capture dump finished");
}

fn midi_worker(mut receiver: MidiReceiver, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 64];
    while !stop.load(Ordering::Acquire) {
        let n = receiver.read(&mut buf);
        if n == 0 {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        let hex: Vec<String> = buf[..n].iter().map(|b| format!("{b:02x}")).collect();
        println!("midi in: {}", hex.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_stereo_zero_fills_upper_channels() {
        let stereo = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let expanded = expand_stereo(&stereo);
        assert_eq!(
            expanded,
            vec![1, 2, 3, 4, 5, 6, 0, 0, 0, 0, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
