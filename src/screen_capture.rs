use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use parking_lot::MutexGuard;

use crate::capture::{self, CaptureLoop, StartOutcome};
use crate::output::OutputImage;
use crate::session::{self, CaptureSession};
use crate::settings::{CaptureSettings, LoopSettings, SettingsError};

/// Used To Handle Screen Capture Errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Screen capture has been disposed")]
    Disposed,
    #[error(transparent)]
    SettingsError(#[from] SettingsError),
    #[error(transparent)]
    CaptureLoopError(#[from] capture::Error),
}

/// Captures one display output, resizes each frame on the GPU and encodes it as a bitmap.
///
/// # Example
/// ```no_run
/// use dxgi_mirror::screen_capture::ScreenCapture;
/// use dxgi_mirror::settings::CaptureSettings;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     // Half size copy of the first output of the first adapter
///     let capture = ScreenCapture::new(CaptureSettings::new(0.5, 0, 0)?)?;
///
///     // One frame on demand
///     if let Some(size) = capture.draw(|image| (image.width(), image.height())) {
///         println!("Captured {size:?}");
///     }
///
///     // Or a steady stream on a background thread
///     capture.start(30, |image| println!("Frame of {} bytes", image.len()))?;
///     std::thread::sleep(std::time::Duration::from_secs(1));
///
///     capture.dispose()?;
///     Ok(())
/// }
/// ```
pub struct ScreenCapture {
    capture_loop: CaptureLoop<CaptureSession>,
    release_on_exit: Arc<AtomicBool>,
    disposed: AtomicBool,
}

impl ScreenCapture {
    /// Opens a capture session. See [`CaptureSession::new`].
    ///
    /// # Errors
    ///
    /// Returns a [`session::Error`] when the adapter or output does not exist or the output
    /// cannot be duplicated.
    #[inline]
    pub fn new(settings: CaptureSettings) -> Result<Self, session::Error> {
        let session = CaptureSession::new(settings)?;
        let release_on_exit = session.release_on_exit();

        Ok(Self { capture_loop: CaptureLoop::new(session), release_on_exit, disposed: AtomicBool::new(false) })
    }

    /// Starts capturing at `target_fps`, calling `callback` on the capture thread with every
    /// produced image.
    ///
    /// The callback runs before the next frame is scheduled, so slow callbacks lower the
    /// achieved frame rate. It may call [`ScreenCapture::stop`] or
    /// [`ScreenCapture::dispose`] to end the capture.
    ///
    /// # Errors
    ///
    /// - [`Error::SettingsError`] when `target_fps` is zero
    /// - [`Error::Disposed`] after [`ScreenCapture::dispose`]
    /// - [`Error::CaptureLoopError`] when the capture thread cannot be spawned
    #[inline]
    pub fn start<F>(&self, target_fps: u32, callback: F) -> Result<StartOutcome, Error>
    where
        F: FnMut(OutputImage<'_>) + Send + 'static,
    {
        self.start_with(LoopSettings::new(target_fps)?, callback)
    }

    /// Like [`ScreenCapture::start`] with full control over the loop settings.
    ///
    /// # Errors
    ///
    /// See [`ScreenCapture::start`].
    pub fn start_with<F>(&self, settings: LoopSettings, callback: F) -> Result<StartOutcome, Error>
    where
        F: FnMut(OutputImage<'_>) + Send + 'static,
    {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }

        Ok(self.capture_loop.start(settings, callback)?)
    }

    /// Asks the capture thread to stop after its current cycle.
    #[inline]
    pub fn stop(&self) {
        self.capture_loop.stop();
    }

    /// Stops capturing and waits for the capture thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CaptureLoopError`] if the capture thread panicked.
    #[inline]
    pub fn stop_and_wait(&self) -> Result<(), Error> {
        Ok(self.capture_loop.stop_and_wait()?)
    }

    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.capture_loop.is_running()
    }

    /// Captures a single frame and passes it to `f`.
    ///
    /// Returns `None` when no new frame arrived in time or the capture failed, and when
    /// called from the capture callback. Waits for the capture thread to finish its current
    /// cycle if it is running.
    #[inline]
    pub fn draw<R>(&self, f: impl FnOnce(OutputImage<'_>) -> R) -> Option<R> {
        if self.capture_loop.on_loop_thread() {
            warn!("Draw called from the capture callback, which already holds the session");
            return None;
        }

        self.capture_loop.source().draw().map(f)
    }

    /// Locks the session for direct use. Must not be called from the capture callback.
    #[inline]
    pub fn session(&self) -> MutexGuard<'_, CaptureSession> {
        self.capture_loop.source()
    }

    /// Stops the capture thread, waits for it, then releases every GPU and duplication
    /// handle. Later calls do nothing.
    ///
    /// Called from the capture callback, this only stops the loop; the capture thread
    /// releases the handles on its way out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CaptureLoopError`] if the capture thread panicked. The handles are
    /// released regardless.
    pub fn dispose(&self) -> Result<(), Error> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.capture_loop.on_loop_thread() {
            debug!("Disposing screen capture from its capture thread");
            self.release_on_exit.store(true, Ordering::Release);
            self.capture_loop.stop();
            return Ok(());
        }

        debug!("Disposing screen capture");
        let stopped = self.capture_loop.stop_and_wait();
        self.capture_loop.source().release();

        Ok(stopped?)
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("Screen capture did not shut down cleanly: {e}");
        }
    }
}
