//! Encoded images handed to callers.
use image::{ImageFormat, RgbaImage};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Buffer is too short to hold a bitmap header")]
    Truncated,
    #[error("Buffer does not start with a bitmap file signature")]
    NotABitmap,
    #[error("Failed to decode bitmap: {0}")]
    DecodeError(#[from] image::ImageError),
}

const FILE_HEADER_LEN: usize = 14;
const WIDTH_OFFSET: usize = FILE_HEADER_LEN + 4;
const HEIGHT_OFFSET: usize = FILE_HEADER_LEN + 8;

/// A self-contained bitmap (file header plus pixel data) produced by one capture cycle.
///
/// The bytes live in a buffer owned by the encoder and are overwritten by the next
/// capture, which the borrow expresses: copy them with [`OutputImage::to_vec`] to keep
/// them longer.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct OutputImage<'a> {
    bytes: &'a [u8],
}

impl<'a> OutputImage<'a> {
    /// Wraps an encoded bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Truncated`] or [`Error::NotABitmap`] when `bytes` does not begin with
    /// a bitmap file and info header.
    #[inline]
    pub fn new(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEIGHT_OFFSET + 4 {
            return Err(Error::Truncated);
        }
        if &bytes[..2] != b"BM" {
            return Err(Error::NotABitmap);
        }

        Ok(Self { bytes })
    }

    /// The encoded bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Pixel width read from the bitmap info header.
    #[inline]
    #[must_use]
    pub fn width(&self) -> u32 {
        self.header_field(WIDTH_OFFSET).unsigned_abs()
    }

    /// Pixel height read from the bitmap info header. Top-down bitmaps store it negated.
    #[inline]
    #[must_use]
    pub fn height(&self) -> u32 {
        self.header_field(HEIGHT_OFFSET).unsigned_abs()
    }

    /// Decodes the bitmap into RGBA pixels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecodeError`] when the pixel data is malformed.
    #[inline]
    pub fn decode(&self) -> Result<RgbaImage, Error> {
        Ok(image::load_from_memory_with_format(self.bytes, ImageFormat::Bmp)?.into_rgba8())
    }

    /// Copies the bytes out of the encoder's buffer.
    #[inline]
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    fn header_field(&self, offset: usize) -> i32 {
        let mut field = [0u8; 4];
        field.copy_from_slice(&self.bytes[offset..offset + 4]);
        i32::from_le_bytes(field)
    }
}

impl AsRef<[u8]> for OutputImage<'_> {
    fn as_ref(&self) -> &[u8] {
        self.bytes
    }
}
