//! The capture session: every long-lived GPU and duplication handle for one output.
//!
//! One cycle acquires a desktop frame, draws it scaled into a fresh GPU texture, hands the
//! frame back to DXGI, and encodes the texture as a bitmap:
//!
//! ```text
//! acquire -> resize -> release -> encode
//! ```
//!
//! Handles are released explicitly by [`CaptureSession::release`] in dependency order.
//! Dropping an unreleased session runs the same release as a fallback.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use windows::Win32::Foundation::E_ACCESSDENIED;
use windows::Win32::Graphics::Direct2D::ID2D1Device;
use windows::Win32::Graphics::Direct3D11::{ID3D11Device, ID3D11DeviceContext};
use windows::Win32::Graphics::Dxgi::IDXGIOutput1;
use windows::Win32::UI::HiDpi::{DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2, SetProcessDpiAwarenessContext};

use crate::capture::FrameSource;
use crate::com::{Apartment, MtaUsage};
use crate::direct2d::{self, DrawContext, ResizeTarget};
use crate::dxgi_duplication_api::{self, DesktopDuplication};
use crate::encoder::{self, BitmapEncoder};
use crate::lifecycle::{self, Resource};
use crate::output::OutputImage;
use crate::release_in_order;
use crate::settings::CaptureSettings;

/// Used To Handle Capture Session Errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("DirectX error: {0}")]
    DirectXError(#[from] crate::d3d11::Error),
    #[error("Duplication error: {0}")]
    DuplicationError(#[from] dxgi_duplication_api::Error),
    #[error("Resize error: {0}")]
    ResizeError(#[from] direct2d::Error),
    #[error("Encoder error: {0}")]
    EncoderError(#[from] encoder::Error),
    #[error(transparent)]
    LifecycleError(#[from] lifecycle::Error),
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

impl Error {
    /// Whether this is a failure to open the session that retrying with the same settings
    /// cannot fix.
    #[must_use]
    pub const fn is_fatal_init(&self) -> bool {
        matches!(
            self,
            Self::DirectXError(crate::d3d11::Error::AdapterNotFound(_) | crate::d3d11::Error::OutputNotFound(_))
        )
    }
}

/// Owns the devices, the duplication interface and the two draw contexts of one output.
pub struct CaptureSession {
    settings: CaptureSettings,
    duplication: Resource<DesktopDuplication>,
    frame_context: Resource<DrawContext>,
    target_context: Resource<DrawContext>,
    encoder: Resource<BitmapEncoder>,
    d2d_device: Resource<ID2D1Device>,
    output: Resource<IDXGIOutput1>,
    d3d_device_context: Resource<ID3D11DeviceContext>,
    d3d_device: Resource<ID3D11Device>,
    mta: Resource<MtaUsage>,
    loop_apartment: Option<Apartment>,
    release_on_exit: Arc<AtomicBool>,
    released: bool,
}

// SAFETY: the Direct2D factory is created multi-threaded and the D3D11 device is
// free-threaded. The immediate context and the draw contexts are only touched through
// `&mut self`, and `CaptureLoop` serializes every such access behind one mutex.
// `loop_apartment` is only set and cleared on the loop thread by the thread hooks.
unsafe impl Send for CaptureSession {}

impl CaptureSession {
    /// Opens a session on the output and adapter named by `settings`.
    ///
    /// # Errors
    ///
    /// - [`crate::d3d11::Error::AdapterNotFound`] or [`crate::d3d11::Error::OutputNotFound`]
    ///   when an index is out of range
    /// - [`dxgi_duplication_api::Error::Unavailable`] when the output cannot be duplicated,
    ///   for example while another process holds it or the secure desktop is showing
    /// - any device, Direct2D or imaging failure while building the pipeline
    pub fn new(settings: CaptureSettings) -> Result<Self, Error> {
        // Callers that never initialized COM run in the implicit MTA while this is held
        let mta = MtaUsage::new()?;

        // Set the process to be per-monitor DPI aware so output sizes are physical pixels.
        match unsafe { SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2) } {
            Ok(()) => (),
            Err(e) => {
                // returns E_ACCESSDENIED when the awareness has already been set
                if e.code() != E_ACCESSDENIED {
                    return Err(Error::WindowsError(e));
                }
            }
        }

        let factory = crate::d3d11::create_dxgi_factory()?;
        let adapter = crate::d3d11::find_adapter(&factory, settings.adapter_index())?;
        let output = crate::d3d11::find_output(&adapter, settings.output_index())?;
        let (d3d_device, d3d_device_context) = crate::d3d11::create_d3d_device(&adapter, settings.is_debug_layer())?;

        let duplication = DesktopDuplication::new(&output, &d3d_device)?;

        let d2d_device = direct2d::create_device(&d3d_device, settings.is_debug_layer())?;
        let frame_context = DrawContext::new(&d2d_device)?;
        let target_context = DrawContext::new(&d2d_device)?;
        let encoder = BitmapEncoder::new(&d2d_device)?;

        let (numerator, denominator) = duplication.refresh_rate();
        info!(
            "Capture session opened on adapter {} output {} ({}x{} at {:.2} Hz, scale {})",
            settings.adapter_index(),
            settings.output_index(),
            duplication.width(),
            duplication.height(),
            f64::from(numerator) / f64::from(denominator.max(1)),
            settings.scale()
        );

        Ok(Self {
            settings,
            duplication: Resource::new("duplication", duplication),
            frame_context: Resource::new("frame draw context", frame_context),
            target_context: Resource::new("target draw context", target_context),
            encoder: Resource::new("bitmap encoder", encoder),
            d2d_device: Resource::new("Direct2D device", d2d_device),
            output: Resource::new("output", output),
            d3d_device_context: Resource::new("Direct3D device context", d3d_device_context),
            d3d_device: Resource::new("Direct3D device", d3d_device),
            mta: Resource::new("MTA usage", mta),
            loop_apartment: None,
            release_on_exit: Arc::new(AtomicBool::new(false)),
            released: false,
        })
    }

    #[inline]
    #[must_use]
    pub const fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Flag that, once set, makes the session release itself when the capture loop thread
    /// driving it exits.
    #[inline]
    #[must_use]
    pub fn release_on_exit(&self) -> Arc<AtomicBool> {
        self.release_on_exit.clone()
    }

    /// Whether [`CaptureSession::release`] has run.
    #[inline]
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Gets the underlying [`windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext`].
    ///
    /// # Errors
    ///
    /// Returns [`lifecycle::Error::Released`] after [`CaptureSession::release`].
    #[inline]
    pub const fn device_context(&self) -> Result<&ID3D11DeviceContext, lifecycle::Error> {
        self.d3d_device_context.get()
    }

    /// Runs one capture cycle and returns the encoded image.
    ///
    /// Returns `Ok(None)` when no new frame arrived within the acquire timeout.
    ///
    /// # Errors
    ///
    /// Any acquire, resize or encode failure. The acquired frame is released on every path.
    pub fn capture(&mut self) -> Result<Option<OutputImage<'_>>, Error> {
        let Some(target) = self.acquire_and_resize()? else {
            return Ok(None);
        };

        let dpi = self.target_context.get()?.dpi();
        let image = self.encoder.get_mut()?.encode(&target, dpi)?;

        Ok(Some(image))
    }

    /// Runs one capture cycle, logging any failure and reporting it as no image.
    #[inline]
    pub fn draw(&mut self) -> Option<OutputImage<'_>> {
        match self.capture() {
            Ok(image) => image,
            Err(e) => {
                warn!("Capture failed: {e}");
                None
            }
        }
    }

    fn acquire_and_resize(&mut self) -> Result<Option<ResizeTarget>, Error> {
        self.ensure_duplication()?;

        let result = self.resize_next_frame();
        if let Err(Error::DuplicationError(dxgi_duplication_api::Error::AccessLost)) = &result {
            debug!("Duplication access lost, recreating it before the next cycle");
            self.duplication.release();
        }

        result
    }

    fn resize_next_frame(&mut self) -> Result<Option<ResizeTarget>, Error> {
        let timeout_ms = self.settings.timeout_ms();
        let Some(frame) = self.duplication.get_mut()?.acquire_next_frame(timeout_ms)? else {
            return Ok(None);
        };

        let target = direct2d::resize(
            self.d3d_device.get()?,
            self.frame_context.get()?,
            self.target_context.get()?,
            &frame,
            self.settings.scale(),
        )?;

        // Hand the frame back before the slower encode
        drop(frame);

        Ok(Some(target))
    }

    /// Re-duplicates the output after access was lost. Does nothing once released.
    fn ensure_duplication(&mut self) -> Result<(), Error> {
        if self.released || !self.duplication.is_released() {
            return Ok(());
        }

        let duplication = DesktopDuplication::new(self.output.get()?, self.d3d_device.get()?)?;
        self.duplication.replace(duplication);
        debug!("Duplication recreated");

        Ok(())
    }

    /// Releases every handle, dependents before the devices they were created from.
    ///
    /// Safe to call more than once; later calls release nothing.
    pub fn release(&mut self) {
        self.released = true;

        let released = release_in_order!(
            self.duplication,
            self.frame_context,
            self.target_context,
            self.encoder,
            self.d2d_device,
            self.output,
            self.d3d_device_context,
            self.d3d_device,
            self.mta,
        );

        if released > 0 {
            info!("Capture session released ({released} handles)");
        }
    }
}

impl FrameSource for CaptureSession {
    type Error = Error;

    #[inline]
    fn capture(&mut self) -> Result<Option<OutputImage<'_>>, Self::Error> {
        Self::capture(self)
    }

    fn on_thread_start(&mut self) {
        self.loop_apartment = Some(Apartment::multithreaded());
    }

    fn on_thread_stop(&mut self) {
        if self.release_on_exit.load(Ordering::Acquire) {
            self.release();
        }

        self.loop_apartment = None;
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.released {
            debug!("Capture session dropped without release, releasing now");
        }

        self.release();
    }
}
