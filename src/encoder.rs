//! Bitmap encoding of resized frames.
//!
//! The Windows Imaging Component image encoder writes the Direct2D bitmap straight into
//! the container, so the pixels are read back inside WIC rather than through a staging
//! texture of our own.
use std::ptr;

use log::{debug, trace};
use windows::Win32::Graphics::Direct2D::Common::{D2D1_ALPHA_MODE_PREMULTIPLIED, D2D1_PIXEL_FORMAT};
use windows::Win32::Graphics::Direct2D::ID2D1Device;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM;
use windows::Win32::Graphics::Imaging::D2D::{IWICImageEncoder, IWICImagingFactory2, WICImageParameters};
use windows::Win32::Graphics::Imaging::{
    CLSID_WICImagingFactory2, GUID_ContainerFormatBmp, IWICBitmapFrameEncode, WICBitmapEncoderNoCache,
};
use windows::Win32::System::Com::StructuredStorage::IPropertyBag2;
use windows::Win32::System::Com::{CLSCTX_INPROC_SERVER, CoCreateInstance, IStream, STREAM_SEEK_END, STREAM_SEEK_SET};
use windows::Win32::UI::Shell::SHCreateMemStream;

use crate::direct2d::ResizeTarget;
use crate::output::{self, OutputImage};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to create an in-memory stream")]
    StreamUnavailable,
    #[error("CreateNewFrame succeeded without returning a frame")]
    MissingFrame,
    #[error("Encoded image is malformed: {0}")]
    MalformedImage(#[from] output::Error),
    #[error("Integer conversion error: {0}")]
    IntConversionError(#[from] std::num::TryFromIntError),
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// Encodes [`ResizeTarget`]s into bitmap files held in one reusable buffer.
pub struct BitmapEncoder {
    factory: IWICImagingFactory2,
    image_encoder: IWICImageEncoder,
    stream: Option<IStream>,
    buffer: Vec<u8>,
}

impl BitmapEncoder {
    /// Creates an encoder able to read bitmaps of `d2d_device`.
    ///
    /// COM must already be initialized on the calling thread.
    #[inline]
    pub fn new(d2d_device: &ID2D1Device) -> Result<Self, Error> {
        let factory: IWICImagingFactory2 =
            unsafe { CoCreateInstance(&CLSID_WICImagingFactory2, None, CLSCTX_INPROC_SERVER)? };
        let image_encoder = unsafe { factory.CreateImageEncoder(d2d_device)? };

        Ok(Self { factory, image_encoder, stream: None, buffer: Vec::new() })
    }

    /// Encodes `target` as a bitmap file.
    ///
    /// The returned image borrows the encoder's buffer, which the next call overwrites.
    pub fn encode(&mut self, target: &ResizeTarget, dpi: (f32, f32)) -> Result<OutputImage<'_>, Error> {
        let stream = self.stream()?;

        // Rewind and truncate so a smaller frame never inherits the tail of a larger one
        unsafe {
            stream.Seek(0, STREAM_SEEK_SET, None)?;
            stream.SetSize(0)?;
        }

        let encoder = unsafe { self.factory.CreateEncoder(&GUID_ContainerFormatBmp, ptr::null())? };
        unsafe { encoder.Initialize(&stream, WICBitmapEncoderNoCache)? };

        let mut frame: Option<IWICBitmapFrameEncode> = None;
        let mut options: Option<IPropertyBag2> = None;
        unsafe { encoder.CreateNewFrame(&mut frame, &mut options)? };
        let frame = frame.ok_or(Error::MissingFrame)?;
        unsafe { frame.Initialize(options.as_ref())? };

        let parameters = WICImageParameters {
            PixelFormat: D2D1_PIXEL_FORMAT { format: DXGI_FORMAT_B8G8R8A8_UNORM, alphaMode: D2D1_ALPHA_MODE_PREMULTIPLIED },
            DpiX: dpi.0,
            DpiY: dpi.1,
            Top: 0.0,
            Left: 0.0,
            PixelWidth: target.width(),
            PixelHeight: target.height(),
        };

        unsafe {
            self.image_encoder.WriteFrame(target.bitmap(), &frame, Some(ptr::from_ref(&parameters)))?;
            frame.Commit()?;
            encoder.Commit()?;
        }

        // Copy the encoded file out of the stream into the reused buffer
        let mut length = 0u64;
        unsafe {
            stream.Seek(0, STREAM_SEEK_END, Some(ptr::from_mut(&mut length)))?;
            stream.Seek(0, STREAM_SEEK_SET, None)?;
        }

        let length = u32::try_from(length)?;
        self.buffer.clear();
        self.buffer.resize(length as usize, 0);

        let mut read = 0u32;
        unsafe { stream.Read(self.buffer.as_mut_ptr().cast(), length, Some(ptr::from_mut(&mut read))).ok()? };
        self.buffer.truncate(read as usize);

        trace!("Encoded {}x{} frame into {} bytes", target.width(), target.height(), self.buffer.len());

        Ok(OutputImage::new(&self.buffer)?)
    }

    fn stream(&mut self) -> Result<IStream, Error> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }

        debug!("Creating the in-memory encoder stream");
        let stream = unsafe { SHCreateMemStream(None) }.ok_or(Error::StreamUnavailable)?;
        self.stream = Some(stream.clone());

        Ok(stream)
    }
}
