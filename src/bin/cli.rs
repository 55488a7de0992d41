use anyhow::{bail, Context, Result};
use kioskcam::types::standard_candidates;
use kioskcam::{CameraManager, CaptureOptions, KioskCamConfig, LogSink, Resolution};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    kioskcam::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: kioskcam-cli <probe|capture|burst|preview> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "probe" => cmd_probe(&args),
        "capture" => cmd_capture(&args),
        "burst" => cmd_burst(&args),
        "preview" => cmd_preview(&args),
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

fn start_camera() -> Result<CameraManager> {
    let config = KioskCamConfig::load_or_default();
    CameraManager::with_native_backend(config, Arc::new(LogSink)).context("starting camera worker")
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;
    Ok(stop)
}

fn cmd_probe(args: &[String]) -> Result<()> {
    let json = args.contains(&"--json".to_string());
    let camera = start_camera()?;
    let supported = camera.probe_resolutions(standard_candidates());
    camera.shutdown();

    if json {
        println!("{}", serde_json::to_string(&supported)?);
    } else if supported.is_empty() {
        println!("No supported resolutions (is a camera connected?)");
    } else {
        for label in supported {
            println!("{}", label);
        }
    }
    Ok(())
}

fn cmd_capture(args: &[String]) -> Result<()> {
    // capture [dest] [--size WxH] [--quality N] [--json]
    let mut dest = None;
    let mut size: Option<Resolution> = None;
    let mut quality = None;
    let mut json = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--size" => {
                i += 1;
                let value = args.get(i).context("--size needs a value like 1920x1080")?;
                size = Some(value.parse().map_err(anyhow::Error::msg)?);
            }
            "--quality" => {
                i += 1;
                let value = args.get(i).context("--quality needs a value")?;
                quality = Some(value.parse::<u8>()?);
            }
            "--json" => json = true,
            other => {
                if dest.is_some() {
                    bail!("Unexpected argument: {}", other);
                }
                dest = Some(PathBuf::from(other));
            }
        }
        i += 1;
    }

    let mut options = CaptureOptions::new(dest.unwrap_or_else(|| PathBuf::from("captures")));
    if let Some(size) = size {
        options = options.with_size(size.width, size.height);
    }
    if let Some(quality) = quality {
        options = options.with_quality(quality);
    }

    let camera = start_camera()?;
    camera.start_stream();
    let result = camera.capture_and_wait(options);
    camera.shutdown();

    let Some(result) = result else {
        bail!("capture rejected");
    };
    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        match &result.saved_path {
            Some(path) => println!("{} ({})", path.display(), result.effective),
            None => println!("No image saved: {:?}", result.failure),
        }
        if result.mismatch {
            println!("Requested size not available, driver delivered {}", result.effective);
        }
    }
    if !result.is_saved() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_burst(args: &[String]) -> Result<()> {
    if args.len() < 4 {
        eprintln!("Usage: kioskcam-cli burst <count> <interval_ms> [dest]");
        std::process::exit(1);
    }
    let count: u32 = args[2].parse().context("count")?;
    let interval = Duration::from_millis(args[3].parse().context("interval_ms")?);
    let dest = args
        .get(4)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("captures"));

    let stop = interrupt_flag()?;
    let camera = start_camera()?;
    camera.start_stream();

    let mut saved = 0;
    for shot in 0..count {
        if stop.load(Ordering::SeqCst) {
            println!("Interrupted after {} shots", shot);
            break;
        }
        let started = Instant::now();
        match camera.capture_and_wait(CaptureOptions::new(&dest)) {
            Some(result) if result.is_saved() => {
                saved += 1;
                if let Some(path) = &result.saved_path {
                    println!("[{}/{}] {}", shot + 1, count, path.display());
                }
            }
            Some(result) => println!("[{}/{}] failed: {:?}", shot + 1, count, result.failure),
            None => println!("[{}/{}] rejected", shot + 1, count),
        }
        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    camera.shutdown();
    println!("Saved {} of {} images to {}", saved, count, dest.display());
    Ok(())
}

fn cmd_preview(args: &[String]) -> Result<()> {
    let secs: u64 = match args.get(2) {
        Some(value) => value.parse().context("seconds")?,
        None => 10,
    };

    let stop = interrupt_flag()?;
    let camera = start_camera()?;
    camera.start_stream();

    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        let stats = camera.stats();
        let latest = camera
            .latest_frame()
            .map(|f| f.resolution().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "frames ok={} failed={} open={} latest={}",
            stats.frames_ok, stats.frames_failed, stats.device_open, latest
        );
    }

    camera.shutdown();
    Ok(())
}
