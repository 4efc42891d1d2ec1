#[cfg(windows)]
mod mirror {
    use std::io::{self, Write};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use clap::Parser;
    use dxgi_mirror::screen_capture::ScreenCapture;
    use dxgi_mirror::settings::{CaptureSettings, LoopSettings};
    use parking_lot::Mutex;
    use tracing_subscriber::EnvFilter;

    #[derive(Parser)]
    #[command(name = "Screen Mirror")]
    #[command(version = "1.0")]
    #[command(about = "Mirrors a display output as resized bitmaps")]
    struct Cli {
        /// Scale factor applied to both dimensions
        #[arg(long, default_value_t = 0.5)]
        scale: f64,

        /// Output index on the adapter
        #[arg(long, default_value_t = 0)]
        output: u32,

        /// Adapter index
        #[arg(long, default_value_t = 0)]
        adapter: u32,

        /// Target frame rate
        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Stop after this many seconds, or run until Ctrl+C
        #[arg(long)]
        seconds: Option<u64>,

        /// Stop after this many consecutive capture failures
        #[arg(long)]
        failure_limit: Option<u32>,

        /// Where to save the last frame
        #[arg(long, default_value = "mirror.bmp")]
        path: PathBuf,

        /// Enable the Direct3D and Direct2D debug layers
        #[arg(long)]
        debug_layer: bool,
    }

    struct Stats {
        frames: u64,
        last_reset: Instant,
        frames_since_reset: u64,
    }

    pub fn main() -> Result<(), Box<dyn std::error::Error>> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();

        let cli = Cli::parse();

        let stop_flag = Arc::new(AtomicBool::new(false));
        {
            let stop_flag = stop_flag.clone();
            ctrlc::set_handler(move || {
                stop_flag.store(true, Ordering::SeqCst);
            })?;
        }

        let settings = CaptureSettings::new(cli.scale, cli.output, cli.adapter)?.debug_layer(cli.debug_layer);
        let capture = ScreenCapture::new(settings)?;

        let last_frame = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(Mutex::new(Stats { frames: 0, last_reset: Instant::now(), frames_since_reset: 0 }));

        let loop_settings = LoopSettings::new(cli.fps)?.failure_limit(cli.failure_limit);
        {
            let last_frame = last_frame.clone();
            let stats = stats.clone();
            capture.start_with(loop_settings, move |image| {
                // Copy out, the buffer is reused by the next frame
                *last_frame.lock() = image.to_vec();

                let mut stats = stats.lock();
                stats.frames += 1;
                stats.frames_since_reset += 1;

                let elapsed = stats.last_reset.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    print!(
                        "\rFrame: {}x{} | FPS: {:.2} | Total: {}",
                        image.width(),
                        image.height(),
                        stats.frames_since_reset as f64 / elapsed.as_secs_f64(),
                        stats.frames
                    );
                    let _ = io::stdout().flush();

                    stats.frames_since_reset = 0;
                    stats.last_reset = Instant::now();
                }
            })?;
        }

        let started = Instant::now();
        let deadline = cli.seconds.map(Duration::from_secs);
        while !stop_flag.load(Ordering::SeqCst)
            && capture.is_running()
            && deadline.is_none_or(|deadline| started.elapsed() < deadline)
        {
            thread::sleep(Duration::from_millis(50));
        }

        capture.dispose()?;
        println!("\nCapture stopped after {} frames.", stats.lock().frames);

        let last_frame = last_frame.lock();
        if last_frame.is_empty() {
            eprintln!("No frame was captured");
        } else {
            std::fs::write(&cli.path, &*last_frame)?;
            println!("Saved {}", cli.path.display());
        }

        Ok(())
    }
}

#[cfg(windows)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    mirror::main()
}

#[cfg(not(windows))]
fn main() {
    eprintln!("Desktop duplication is only available on Windows");
}
