//! Background capture loop.
//!
//! [`CaptureLoop`] drives any [`FrameSource`] on a dedicated thread at a target frame rate
//! and hands every produced image to a callback on that thread. At most one loop thread
//! exists per [`CaptureLoop`], and every capture, whether from the loop or from
//! [`CaptureLoop::source`], runs under the same lock.
use std::cell::Cell;
use std::io;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::output::OutputImage;
use crate::pacing::{FpsCounter, FramePacer};
use crate::settings::LoopSettings;

/// Used To Handle Capture Loop Errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed To Spawn Capture Thread: {0}")]
    FailedToSpawnThread(#[from] io::Error),
    #[error("Capture Thread Panicked")]
    FailedToJoinThread,
    #[error("The Capture Loop Cannot Be Restarted From Its Own Thread")]
    RestartFromLoopThread,
}

/// Something that can produce one encoded image per call.
pub trait FrameSource: Send + 'static {
    /// Error reported for a failed cycle. The loop logs it and carries on.
    type Error: std::error::Error;

    /// Runs one capture cycle.
    ///
    /// Returns `Ok(None)` when no new frame was available within the source's wait window.
    fn capture(&mut self) -> Result<Option<OutputImage<'_>>, Self::Error>;

    /// Called on the loop thread before its first cycle.
    #[inline]
    fn on_thread_start(&mut self) {}

    /// Called on the loop thread after its last cycle, also when the thread unwinds.
    #[inline]
    fn on_thread_stop(&mut self) {}
}

/// What a call to [`CaptureLoop::start`] did.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum StartOutcome {
    /// A new loop thread was spawned.
    Started,
    /// The loop was already running; nothing changed.
    AlreadyRunning,
    /// Another caller is in the middle of starting the loop; nothing changed.
    StartInProgress,
}

/// Clears the start-in-progress flag on every exit path of `start`.
struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Clears the running flag when the loop thread exits, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs [`FrameSource::on_thread_stop`] when the loop thread exits, including by panic.
struct ThreadHooks<'a, S: FrameSource>(&'a Mutex<S>);

impl<'a, S: FrameSource> ThreadHooks<'a, S> {
    fn enter(source: &'a Mutex<S>) -> Self {
        source.lock().on_thread_start();
        Self(source)
    }
}

impl<S: FrameSource> Drop for ThreadHooks<'_, S> {
    fn drop(&mut self) {
        self.0.lock().on_thread_stop();
    }
}

thread_local! {
    /// Address of the source driven by the loop running on this thread, zero elsewhere.
    static LOOP_SOURCE: Cell<usize> = const { Cell::new(0) };
}

/// Drives a [`FrameSource`] on a background thread.
///
/// # Example
/// ```
/// use std::convert::Infallible;
///
/// use dxgi_mirror::capture::{CaptureLoop, FrameSource, StartOutcome};
/// use dxgi_mirror::output::OutputImage;
/// use dxgi_mirror::settings::LoopSettings;
///
/// struct Idle;
///
/// impl FrameSource for Idle {
///     type Error = Infallible;
///
///     fn capture(&mut self) -> Result<Option<OutputImage<'_>>, Self::Error> {
///         Ok(None)
///     }
/// }
///
/// let capture_loop = CaptureLoop::new(Idle);
/// let outcome = capture_loop.start(LoopSettings::new(30).unwrap(), |image| println!("{} bytes", image.len()));
/// assert_eq!(outcome.unwrap(), StartOutcome::Started);
///
/// capture_loop.stop_and_wait().unwrap();
/// assert!(!capture_loop.is_running());
/// ```
pub struct CaptureLoop<S: FrameSource> {
    source: Arc<Mutex<S>>,
    running: Arc<AtomicBool>,
    starting: AtomicBool,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: FrameSource> CaptureLoop<S> {
    /// Wraps `source`. The loop starts idle.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            running: Arc::new(AtomicBool::new(false)),
            starting: AtomicBool::new(false),
            thread_handle: Mutex::new(None),
        }
    }

    /// Locks the source for direct use, blocking while the loop thread is mid-cycle.
    #[inline]
    pub fn source(&self) -> MutexGuard<'_, S> {
        self.source.lock()
    }

    /// Whether a loop thread is currently running.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the caller is this loop's thread, for example code running inside the callback.
    #[inline]
    #[must_use]
    pub fn on_loop_thread(&self) -> bool {
        LOOP_SOURCE.with(Cell::get) == Arc::as_ptr(&self.source).addr()
    }

    /// Spawns the loop thread, calling `callback` with every produced image.
    ///
    /// Does nothing if the loop is already running or another thread is currently inside
    /// `start`; the losing caller returns immediately. A previous loop thread that is still
    /// winding down after [`CaptureLoop::stop`] is joined before the new one is spawned.
    ///
    /// `callback` runs with the source locked. To end the loop from inside it, call
    /// [`CaptureLoop::stop`].
    ///
    /// # Errors
    ///
    /// - [`Error::FailedToSpawnThread`] if the OS refuses to create the thread. The loop stays
    ///   idle in that case.
    /// - [`Error::RestartFromLoopThread`] when called from the callback after the loop was
    ///   stopped, since the winding-down thread would have to join itself
    pub fn start<F>(&self, settings: LoopSettings, callback: F) -> Result<StartOutcome, Error>
    where
        F: FnMut(OutputImage<'_>) + Send + 'static,
    {
        if self.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        if self.on_loop_thread() {
            return Err(Error::RestartFromLoopThread);
        }

        if self.starting.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            trace!("Capture loop start already in progress");
            return Ok(StartOutcome::StartInProgress);
        }
        let _guard = StartGuard(&self.starting);

        // A racing start may have finished between the first check and the exchange
        if self.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let previous = self.thread_handle.lock().take();
        if let Some(previous) = previous {
            if !previous.is_finished() {
                debug!("Waiting for the previous capture thread to exit");
                self.running.store(false, Ordering::Release);
            }

            if previous.join().is_err() {
                warn!("Previous capture thread panicked");
            }
        }

        self.running.store(true, Ordering::Release);

        let source = self.source.clone();
        let running = self.running.clone();
        let spawned = thread::Builder::new()
            .name("dxgi-mirror-capture".to_string())
            .spawn(move || run_loop(&source, running, settings, callback));

        match spawned {
            Ok(handle) => {
                *self.thread_handle.lock() = Some(handle);
                debug!("Capture loop started at {} fps", settings.target_fps());
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(Error::FailedToSpawnThread(e))
            }
        }
    }

    /// Asks the loop thread to exit after its current cycle. Does not wait for it.
    #[inline]
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("Capture loop stop requested");
        }
    }

    /// Blocks until the current loop thread, if any, has exited.
    ///
    /// Called from the loop thread itself, for example from the callback, this returns at
    /// once; the thread exits after its current cycle once [`CaptureLoop::stop`] was called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedToJoinThread`] if the loop thread panicked.
    pub fn wait(&self) -> Result<(), Error> {
        if self.on_loop_thread() {
            trace!("Not joining the capture thread from itself");
            return Ok(());
        }

        let handle = self.thread_handle.lock().take();

        if let Some(handle) = handle {
            handle.join().map_err(|_| Error::FailedToJoinThread)?;
        }

        Ok(())
    }

    /// Stops the loop and waits for its thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedToJoinThread`] if the loop thread panicked.
    #[inline]
    pub fn stop_and_wait(&self) -> Result<(), Error> {
        self.stop();
        self.wait()
    }
}

impl<S: FrameSource> Drop for CaptureLoop<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_wait() {
            warn!("Capture loop did not shut down cleanly: {e}");
        }
    }
}

fn run_loop<S, F>(source: &Mutex<S>, running: Arc<AtomicBool>, settings: LoopSettings, mut callback: F)
where
    S: FrameSource,
    F: FnMut(OutputImage<'_>),
{
    LOOP_SOURCE.with(|loop_source| loop_source.set(ptr::from_ref(source).addr()));

    let running = RunningGuard(running);
    let _hooks = ThreadHooks::enter(source);
    let pacer = FramePacer::new(settings.target_fps(), settings.overhead());
    let mut fps_counter = FpsCounter::new();
    let mut failures = 0u32;

    while running.0.load(Ordering::Acquire) {
        let cycle_start = Instant::now();

        let produced = {
            let mut source = source.lock();
            match source.capture() {
                Ok(Some(image)) => {
                    failures = 0;
                    callback(image);
                    true
                }
                Ok(None) => {
                    trace!("No new frame within the acquire timeout");
                    false
                }
                Err(e) => {
                    failures += 1;
                    warn!("Capture cycle failed ({failures} in a row): {e}");
                    false
                }
            }
        };

        if settings.limit().is_some_and(|limit| failures >= limit.get()) {
            error!("Stopping capture loop after {failures} consecutive failed cycles");
            break;
        }

        let sleep = if produced {
            if let Some(rate) = fps_counter.tick(Instant::now()) {
                debug!("Capture rate: {rate} fps");
            }

            pacer.sleep_after_frame(cycle_start.elapsed())
        } else {
            pacer.sleep_after_idle()
        };

        thread::sleep(sleep);
    }

    debug!("Capture loop exited");
}
