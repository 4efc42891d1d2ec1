//! Direct2D draw contexts and the GPU resize step.
use std::ptr;

use windows::Win32::Graphics::Direct2D::Common::D2D_RECT_F;
use windows::Win32::Graphics::Direct2D::{
    D2D1_DEBUG_LEVEL_INFORMATION, D2D1_DEBUG_LEVEL_NONE, D2D1_DEVICE_CONTEXT_OPTIONS_ENABLE_MULTITHREADED_OPTIMIZATIONS,
    D2D1_FACTORY_OPTIONS, D2D1_FACTORY_TYPE_MULTI_THREADED, D2D1_INTERPOLATION_MODE_HIGH_QUALITY_CUBIC,
    D2D1CreateFactory, ID2D1Bitmap1, ID2D1Device, ID2D1DeviceContext, ID2D1Factory1, ID2D1Image,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BIND_RENDER_TARGET, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, ID3D11Device, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{IDXGIDevice, IDXGISurface};
use windows::core::Interface;

use crate::dxgi_duplication_api::{self, AcquiredFrame};
use crate::settings;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Scaling a {width}x{height} frame by {scale} leaves nothing to draw")]
    EmptyTarget { width: u32, height: u32, scale: f64 },
    #[error("CreateTexture2D succeeded without returning a texture")]
    MissingTexture,
    #[error("Frame error: {0}")]
    FrameError(#[from] dxgi_duplication_api::Error),
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// Creates the Direct2D device that shares `d3d_device`'s GPU.
#[inline]
pub fn create_device(d3d_device: &ID3D11Device, debug_layer: bool) -> Result<ID2D1Device, Error> {
    let options = D2D1_FACTORY_OPTIONS {
        debugLevel: if debug_layer { D2D1_DEBUG_LEVEL_INFORMATION } else { D2D1_DEBUG_LEVEL_NONE },
    };

    let factory =
        unsafe { D2D1CreateFactory::<ID2D1Factory1>(D2D1_FACTORY_TYPE_MULTI_THREADED, Some(ptr::from_ref(&options)))? };
    let dxgi_device = d3d_device.cast::<IDXGIDevice>()?;

    Ok(unsafe { factory.CreateDevice(&dxgi_device)? })
}

/// A Direct2D device context. Drawing goes to whichever bitmap is currently bound.
pub struct DrawContext {
    context: ID2D1DeviceContext,
}

impl DrawContext {
    #[inline]
    pub fn new(device: &ID2D1Device) -> Result<Self, Error> {
        let context = unsafe { device.CreateDeviceContext(D2D1_DEVICE_CONTEXT_OPTIONS_ENABLE_MULTITHREADED_OPTIMIZATIONS)? };

        Ok(Self { context })
    }

    /// Gets the underlying [`windows::Win32::Graphics::Direct2D::ID2D1DeviceContext`].
    #[inline]
    #[must_use]
    pub const fn context(&self) -> &ID2D1DeviceContext {
        &self.context
    }

    /// Wraps a DXGI surface as a bitmap of this context, inheriting the surface's format.
    #[inline]
    pub fn bitmap(&self, surface: &IDXGISurface) -> Result<ID2D1Bitmap1, Error> {
        Ok(unsafe { self.context.CreateBitmapFromDxgiSurface(surface, None)? })
    }

    /// Makes `target` the surface subsequent draws render into.
    #[inline]
    pub fn bind(&self, target: &ID2D1Bitmap1) {
        unsafe { self.context.SetTarget(target) };
    }

    /// Drops the reference the context holds on its current target.
    #[inline]
    pub fn unbind(&self) {
        unsafe { self.context.SetTarget(None::<&ID2D1Image>) };
    }

    /// Dots per inch of the context, as (x, y).
    #[inline]
    #[must_use]
    pub fn dpi(&self) -> (f32, f32) {
        let mut dpi_x = 0.0f32;
        let mut dpi_y = 0.0f32;
        unsafe { self.context.GetDpi(&mut dpi_x, &mut dpi_y) };
        (dpi_x, dpi_y)
    }
}

/// A GPU texture holding one scaled frame, kept alive by its Direct2D bitmap.
///
/// A fresh target is allocated every cycle so a resolution change on the output never
/// meets a stale size.
pub struct ResizeTarget {
    bitmap: ID2D1Bitmap1,
    width: u32,
    height: u32,
}

impl ResizeTarget {
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The Direct2D view of the texture.
    #[inline]
    #[must_use]
    pub const fn bitmap(&self) -> &ID2D1Bitmap1 {
        &self.bitmap
    }
}

/// Draws `frame` scaled by `scale` into a newly allocated GPU texture.
///
/// The target measures `floor(width * scale) x floor(height * scale)` and is filled with a
/// single high quality cubic draw. Nothing is read back to the CPU.
pub fn resize(
    d3d_device: &ID3D11Device,
    frame_context: &DrawContext,
    target_context: &DrawContext,
    frame: &AcquiredFrame<'_>,
    scale: f64,
) -> Result<ResizeTarget, Error> {
    let (width, height) = settings::scaled_size(frame.width(), frame.height(), scale);
    if width == 0 || height == 0 {
        return Err(Error::EmptyTarget { width: frame.width(), height: frame.height(), scale });
    }

    // GPU-only texture that Direct2D can render into
    let texture_desc = D3D11_TEXTURE2D_DESC {
        Width: width,
        Height: height,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage: D3D11_USAGE_DEFAULT,
        BindFlags: D3D11_BIND_RENDER_TARGET.0 as u32,
        CPUAccessFlags: 0,
        MiscFlags: 0,
    };

    let mut texture: Option<ID3D11Texture2D> = None;
    unsafe {
        d3d_device.CreateTexture2D(&texture_desc, None, Some(&mut texture))?;
    };
    let texture = texture.ok_or(Error::MissingTexture)?;

    let frame_bitmap = frame_context.bitmap(frame.surface()?)?;
    let bitmap = target_context.bitmap(&texture.cast::<IDXGISurface>()?)?;

    #[allow(clippy::cast_precision_loss)]
    let destination = D2D_RECT_F { left: 0.0, top: 0.0, right: width as f32, bottom: height as f32 };

    target_context.bind(&bitmap);
    let context = target_context.context();
    let drawn = unsafe {
        context.BeginDraw();
        context.DrawBitmap(
            &frame_bitmap,
            Some(ptr::from_ref(&destination)),
            1.0,
            D2D1_INTERPOLATION_MODE_HIGH_QUALITY_CUBIC,
            None,
            None,
        );
        context.EndDraw(None, None)
    };
    target_context.unbind();
    drawn?;

    Ok(ResizeTarget { bitmap, width, height })
}
