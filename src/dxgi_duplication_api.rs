//! DXGI Desktop Duplication wrapper.
//!
//! [`DesktopDuplication`] owns the duplication interface for one output. Acquiring a frame
//! hands back an [`AcquiredFrame`] that mutably borrows the duplication, so a second acquire
//! cannot be issued until the first frame is dropped, and dropping it always releases the
//! frame back to DXGI.
use log::trace;
use windows::Win32::Foundation::E_ACCESSDENIED;
use windows::Win32::Graphics::Direct3D11::{D3D11_TEXTURE2D_DESC, ID3D11Device, ID3D11Texture2D};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_NOT_CURRENTLY_AVAILABLE, DXGI_ERROR_SESSION_DISCONNECTED,
    DXGI_ERROR_UNSUPPORTED, DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_DESC, DXGI_OUTDUPL_FRAME_INFO, IDXGIOutput1,
    IDXGIOutputDuplication, IDXGISurface,
};
use windows::core::Interface;

/// Errors that can occur while using the DXGI Desktop Duplication API wrapper.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The output cannot be duplicated right now: another process holds the maximum number
    /// of duplications, the secure desktop is showing, or the session is remote.
    #[error("Desktop duplication is unavailable for this output: {0}")]
    Unavailable(windows::core::Error),
    /// The duplication access was lost and must be recreated.
    #[error("Duplication access lost; the duplication must be recreated")]
    AccessLost,
    /// AcquireNextFrame reported success without a desktop resource.
    #[error("AcquireNextFrame returned no desktop resource")]
    MissingResource,
    /// Windows API error.
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// The duplication interface bound to one display output.
pub struct DesktopDuplication {
    duplication: IDXGIOutputDuplication,
    duplication_desc: DXGI_OUTDUPL_DESC,
}

impl DesktopDuplication {
    /// Duplicates `output` using `d3d_device`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unavailable`] when the system refuses duplication of this output
    /// - [`Error::WindowsError`] for other failures
    pub fn new(output: &IDXGIOutput1, d3d_device: &ID3D11Device) -> Result<Self, Error> {
        let duplication = match unsafe { output.DuplicateOutput(d3d_device) } {
            Ok(duplication) => duplication,
            Err(e)
                if [
                    E_ACCESSDENIED,
                    DXGI_ERROR_NOT_CURRENTLY_AVAILABLE,
                    DXGI_ERROR_UNSUPPORTED,
                    DXGI_ERROR_SESSION_DISCONNECTED,
                ]
                .contains(&e.code()) =>
            {
                return Err(Error::Unavailable(e));
            }
            Err(e) => return Err(Error::WindowsError(e)),
        };

        let duplication_desc = unsafe { duplication.GetDesc() };

        Ok(Self { duplication, duplication_desc })
    }

    /// Gets the width of the duplicated output.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.duplication_desc.ModeDesc.Width
    }

    /// Gets the height of the duplicated output.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.duplication_desc.ModeDesc.Height
    }

    /// Gets the refresh rate of the duplicated output as (numerator, denominator).
    #[inline]
    #[must_use]
    pub const fn refresh_rate(&self) -> (u32, u32) {
        (self.duplication_desc.ModeDesc.RefreshRate.Numerator, self.duplication_desc.ModeDesc.RefreshRate.Denominator)
    }

    /// Waits up to `timeout_ms` milliseconds for the desktop to present a new frame.
    ///
    /// Returns `Ok(None)` when the wait times out, which is the normal outcome on a static
    /// screen.
    ///
    /// # Errors
    /// - [`Error::AccessLost`] when the display mode changed or the desktop switched; the
    ///   duplication must be recreated
    /// - [`Error::WindowsError`] for other failures during frame acquisition
    pub fn acquire_next_frame(&mut self, timeout_ms: u32) -> Result<Option<AcquiredFrame<'_>>, Error> {
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource = None;

        match unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource) } {
            Ok(()) => (),
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => return Err(Error::AccessLost),
            Err(e) => return Err(Error::WindowsError(e)),
        }

        // From here on the frame is held, and `AcquiredFrame` owns releasing it.
        let mut frame = AcquiredFrame {
            duplication: &self.duplication,
            surface: None,
            texture_desc: D3D11_TEXTURE2D_DESC::default(),
        };

        let resource = resource.ok_or(Error::MissingResource)?;
        let texture = resource.cast::<ID3D11Texture2D>()?;
        unsafe { texture.GetDesc(&mut frame.texture_desc) };
        frame.surface = Some(texture.cast::<IDXGISurface>()?);

        Ok(Some(frame))
    }
}

/// A desktop image held by the duplication until this value is dropped.
pub struct AcquiredFrame<'a> {
    duplication: &'a IDXGIOutputDuplication,
    surface: Option<IDXGISurface>,
    texture_desc: D3D11_TEXTURE2D_DESC,
}

impl AcquiredFrame<'_> {
    /// Gets the width of the frame.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.texture_desc.Width
    }

    /// Gets the height of the frame.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.texture_desc.Height
    }

    /// Gets the frame as a DXGI surface for Direct2D.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingResource`] if the frame carries no surface.
    #[inline]
    pub const fn surface(&self) -> Result<&IDXGISurface, Error> {
        match &self.surface {
            Some(surface) => Ok(surface),
            None => Err(Error::MissingResource),
        }
    }
}

impl Drop for AcquiredFrame<'_> {
    fn drop(&mut self) {
        // The surface reference must go before the frame is handed back.
        self.surface = None;

        // Release failures are not fatal: a lost duplication makes the next acquire fail
        // with `AccessLost`, which is where recovery happens.
        match unsafe { self.duplication.ReleaseFrame() } {
            Ok(()) => trace!("Released duplication frame"),
            Err(e) => trace!("Ignoring ReleaseFrame failure: {e}"),
        }
    }
}
