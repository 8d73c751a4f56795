// Copyright 2025 xsnap Authors
// SPDX-License-Identifier: Apache-2.0

//! CLI entry point
//!
//! Captures a window to a PPM file, once or on an interval.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use log::{info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::Window;

use xsnap::{write_ppm, CaptureOptions, Frame, Strategy};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("xsnap")
        .version("0.1.0")
        .about("Capture an X11 window to a PPM file, using MIT-SHM when available")
        .arg(
            Arg::new("window")
                .short('w')
                .long("window")
                .value_name("ID")
                .help("Target window id, hex (0x...) or decimal; defaults to the root window"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .default_value("snapshot.ppm")
                .help("Destination file (numbered when capturing more than one frame)"),
        )
        .arg(
            Arg::new("direct")
                .long("direct")
                .action(ArgAction::SetTrue)
                .help("Skip MIT-SHM and pull the image through the connection"),
        )
        .arg(
            Arg::new("no-fallback")
                .long("no-fallback")
                .action(ArgAction::SetTrue)
                .help("Fail instead of falling back when the shared path breaks"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("MS")
                .help("Keep refreshing every MS milliseconds until interrupted"),
        )
        .arg(
            Arg::new("count")
                .short('n')
                .long("count")
                .value_name("N")
                .help("Stop after N frames (with --interval)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("failed to initialize logging")?;

    let (conn, screen_num) = x11rb::connect(None).context("failed to connect to X server")?;
    let root = conn.setup().roots[screen_num].root;

    let window = match matches.get_one::<String>("window") {
        Some(spec) => parse_window_id(spec)?,
        None => root,
    };

    let mut opts = if matches.get_flag("direct") {
        CaptureOptions {
            strategy: Strategy::Direct,
            ..CaptureOptions::default()
        }
    } else {
        CaptureOptions::probe(&conn)
    };
    opts.fallback_to_direct = !matches.get_flag("no-fallback");

    let interval = matches
        .get_one::<String>("interval")
        .map(|v| v.parse::<u64>().context("invalid --interval"))
        .transpose()?
        .map(Duration::from_millis);
    let count = matches
        .get_one::<String>("count")
        .map(|v| v.parse::<u64>().context("invalid --count"))
        .transpose()?;

    let output = Path::new(matches.get_one::<String>("output").unwrap());

    let mut slot = Some(Frame::capture(&conn, window, &opts).context("capture failed")?);
    {
        let frame = slot.as_ref().unwrap();
        info!(
            "captured 0x{:08x}: {}x{} depth {} ({})",
            window,
            frame.width,
            frame.height,
            frame.depth,
            if frame.is_shared() { "shared" } else { "direct" }
        );
    }

    match interval {
        None => {
            write_ppm(slot.as_ref().unwrap(), output).context("failed to write image")?;
            info!("wrote {}", output.display());
        }
        Some(interval) => {
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                r.store(false, Ordering::SeqCst);
            })
            .context("failed to install Ctrl+C handler")?;

            let mut written: u64 = 0;
            let mut last = Instant::now();
            while running.load(Ordering::SeqCst) {
                if let Some(frame) = slot.as_ref() {
                    let path = numbered(output, written);
                    write_ppm(frame, &path).context("failed to write image")?;
                    info!("wrote {}", path.display());
                    written += 1;
                }
                if let Some(n) = count {
                    if written >= n {
                        break;
                    }
                }

                // Pace the loop before pulling the next frame.
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
                last = Instant::now();

                if let Err(e) = Frame::refresh(&mut slot, &conn, window, &opts) {
                    warn!("refresh failed: {}", e);
                    if slot.is_none() {
                        bail!("window no longer capturable: {}", e);
                    }
                }
            }
        }
    }

    if let Some(frame) = slot.take() {
        frame.release(&conn);
    }
    Ok(())
}

/// Parse a window id, accepting the hex form xwininfo prints.
fn parse_window_id(spec: &str) -> anyhow::Result<Window> {
    let parsed = if let Some(hex) = spec.strip_prefix("0x").or_else(|| spec.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        spec.parse::<u32>()
    };
    parsed.with_context(|| format!("invalid window id: {}", spec))
}

/// `snapshot.ppm`, 3 -> `snapshot-0003.ppm`
fn numbered(base: &Path, index: u64) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("snapshot");
    let ext = base.extension().and_then(|s| s.to_str()).unwrap_or("ppm");
    base.with_file_name(format!("{}-{:04}.{}", stem, index, ext))
}
