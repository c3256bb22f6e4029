//! vidtap - capture-session monitor
//!
//! Creates the shared-memory frame ring, prints the environment the injected
//! grabber needs, and drains frames while reporting capture statistics. This
//! is the consumer-side harness for bringing up and debugging a grabber.

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use vidtap_core::{CaptureConfig, HotkeyBinding};
use vidtap_shm::CaptureSession;

/// vidtap - shared-memory capture session monitor
#[derive(Parser, Debug)]
#[command(name = "vidtap")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of slots in the frame ring
    #[arg(short, long, default_value = "5")]
    ring_size: u32,

    /// Upper bound on one frame's size in MiB
    #[arg(short, long, default_value = "16")]
    max_frame_mib: u32,

    /// Target frame rate, 0 = unthrottled
    #[arg(short, long, default_value = "30")]
    fps: u32,

    /// Throttle the host (sleep) instead of dropping frames
    #[arg(short, long)]
    limit_fps: bool,

    /// Capture the front buffer instead of the back buffer
    #[arg(long)]
    front_buffer: bool,

    /// Skip the cursor overlay
    #[arg(long)]
    no_cursor: bool,

    /// Hotkey keycode the grabber side should report (0 = none)
    #[arg(long, default_value = "0")]
    hotkey_keycode: u32,

    /// Hotkey modifier mask
    #[arg(long, default_value = "0")]
    hotkey_modifiers: u32,

    /// Stop after this many seconds, 0 = run until Ctrl+C
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_sigint(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("vidtap v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CaptureConfig::new()
        .with_ring_size(args.ring_size)
        .with_max_frame_bytes(args.max_frame_mib.saturating_mul(1024 * 1024))
        .with_target_fps(args.fps)
        .with_limit_fps(args.limit_fps)
        .with_capture_front(args.front_buffer)
        .with_record_cursor(!args.no_cursor);
    if args.hotkey_keycode != 0 {
        config = config.with_hotkey(HotkeyBinding {
            keycode: args.hotkey_keycode,
            modifiers: args.hotkey_modifiers,
        });
    }

    let mut session = CaptureSession::create(&config)?;

    info!("");
    info!("  Launch the capture target with:");
    info!("    GRABBER_SHM={} <command>", session.main_id());
    info!("");
    info!("Press Ctrl+C to stop.");

    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as usize,
        );
    }

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut received: u64 = 0;
    let mut bytes: u64 = 0;
    let mut received_at_report: u64 = 0;

    while RUNNING.load(Ordering::SeqCst) {
        if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
            break;
        }

        let mut idle = true;
        while let Some(frame) = session.try_next_frame() {
            idle = false;
            received += 1;
            bytes += frame.size() as u64;
        }

        let triggers = session.take_hotkey_triggers();
        if triggers > 0 {
            info!("Hotkey pressed {} time(s)", triggers);
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let (width, height) = session.current_size();
            info!(
                "{} frames ({} this second), {} grab calls, {}x{}, {} MiB total",
                received,
                received - received_at_report,
                session.frame_counter(),
                width,
                height,
                bytes / (1024 * 1024)
            );
            received_at_report = received;
            last_report = Instant::now();
        }

        if idle {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    info!(
        "Session finished: {} frames received, {} grab calls on the producer side",
        received,
        session.frame_counter()
    );
    Ok(())
}
