use std::num::NonZeroU32;
use std::time::Duration;

/// Used To Handle Settings Errors
#[derive(thiserror::Error, PartialEq, Clone, Copy, Debug)]
pub enum SettingsError {
    #[error("Scale factor must be finite and greater than zero, got {0}")]
    InvalidScale(f64),
    #[error("Target frame rate must be greater than zero")]
    InvalidFrameRate,
}

/// Default wait for a new desktop frame before a cycle is considered idle.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default allowance for the scheduler's systematic wake-up latency.
pub const DEFAULT_SCHEDULING_OVERHEAD: Duration = Duration::from_millis(7);

/// Settings used to open a capture session on one adapter output.
///
/// # Example
/// ```
/// use std::time::Duration;
///
/// use dxgi_mirror::settings::CaptureSettings;
///
/// let settings = CaptureSettings::new(0.5, 0, 0)
///     .unwrap()
///     .acquire_timeout(Duration::from_millis(100))
///     .debug_layer(false);
///
/// assert_eq!(settings.scaled_size(1920, 1080), (960, 540));
/// ```
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct CaptureSettings {
    scale: f64,
    output_index: u32,
    adapter_index: u32,
    debug_layer: bool,
    acquire_timeout: Duration,
}

impl CaptureSettings {
    /// Creates capture settings for the output `output_index` of the adapter `adapter_index`.
    ///
    /// Values of `scale` below one shrink the frame, values above one enlarge it.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidScale`] when `scale` is not a finite positive number.
    #[inline]
    pub fn new(scale: f64, output_index: u32, adapter_index: u32) -> Result<Self, SettingsError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(SettingsError::InvalidScale(scale));
        }

        Ok(Self {
            scale,
            output_index,
            adapter_index,
            debug_layer: cfg!(debug_assertions),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        })
    }

    /// Requests (or suppresses) the Direct3D debug layer on device creation.
    #[inline]
    #[must_use]
    pub const fn debug_layer(mut self, debug_layer: bool) -> Self {
        self.debug_layer = debug_layer;
        self
    }

    /// Sets how long a single acquire waits for the desktop to present a new frame.
    #[inline]
    #[must_use]
    pub const fn acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    #[inline]
    #[must_use]
    pub const fn scale(&self) -> f64 {
        self.scale
    }

    #[inline]
    #[must_use]
    pub const fn output_index(&self) -> u32 {
        self.output_index
    }

    #[inline]
    #[must_use]
    pub const fn adapter_index(&self) -> u32 {
        self.adapter_index
    }

    #[inline]
    #[must_use]
    pub const fn is_debug_layer(&self) -> bool {
        self.debug_layer
    }

    #[inline]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Acquire timeout in the whole milliseconds DXGI expects, saturating at `u32::MAX`.
    #[inline]
    #[must_use]
    pub fn timeout_ms(&self) -> u32 {
        u32::try_from(self.acquire_timeout.as_millis()).unwrap_or(u32::MAX)
    }

    /// Size of the resize target for a source of `width` x `height`, rounded down.
    #[inline]
    #[must_use]
    pub fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        scaled_size(width, height, self.scale)
    }
}

/// Computes `(floor(width * scale), floor(height * scale))`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn scaled_size(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let scale_axis = |value: u32| (f64::from(value) * scale).floor().clamp(0.0, f64::from(u32::MAX)) as u32;
    (scale_axis(width), scale_axis(height))
}

/// Settings for the background capture loop.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct LoopSettings {
    target_fps: u32,
    scheduling_overhead: Duration,
    failure_limit: Option<NonZeroU32>,
}

impl LoopSettings {
    /// Creates loop settings for `target_fps` frames per second.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidFrameRate`] when `target_fps` is zero.
    #[inline]
    pub const fn new(target_fps: u32) -> Result<Self, SettingsError> {
        if target_fps == 0 {
            return Err(SettingsError::InvalidFrameRate);
        }

        Ok(Self { target_fps, scheduling_overhead: DEFAULT_SCHEDULING_OVERHEAD, failure_limit: None })
    }

    /// Sets the fixed latency subtracted from every sleep after a produced frame.
    #[inline]
    #[must_use]
    pub const fn scheduling_overhead(mut self, scheduling_overhead: Duration) -> Self {
        self.scheduling_overhead = scheduling_overhead;
        self
    }

    /// Stops the loop after `limit` consecutive failed cycles. `None` and `Some(0)` retry
    /// forever.
    ///
    /// Acquire timeouts are not failures and never count towards the limit.
    #[inline]
    #[must_use]
    pub const fn failure_limit(mut self, limit: Option<u32>) -> Self {
        self.failure_limit = match limit {
            Some(limit) => NonZeroU32::new(limit),
            None => None,
        };
        self
    }

    #[inline]
    #[must_use]
    pub const fn target_fps(&self) -> u32 {
        self.target_fps
    }

    #[inline]
    #[must_use]
    pub const fn overhead(&self) -> Duration {
        self.scheduling_overhead
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> Option<NonZeroU32> {
        self.failure_limit
    }
}
