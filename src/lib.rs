//! # DXGI Mirror
//!
//! **DXGI Mirror** continuously captures a display output through the DXGI Desktop
//! Duplication API, scales every frame on the GPU with Direct2D, and encodes it as a
//! bitmap for screen mirroring. Frames never pass through the CPU until the encoder
//! writes the final image.
//!
//! ## Features
//!
//! - GPU-Resident Resize With High Quality Cubic Filtering.
//! - Paced Background Capture At A Target Frame Rate.
//! - At Most One Capture In Flight, Even With Concurrent Starts.
//! - Deterministic, Idempotent Teardown Of Every GPU Handle.
//!
//! ## Usage
//!
//! ```no_run
//! # #[cfg(windows)]
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     use std::time::Duration;
//!
//!     use dxgi_mirror::screen_capture::ScreenCapture;
//!     use dxgi_mirror::settings::CaptureSettings;
//!
//!     // Half Size Frames From The First Output Of The First Adapter
//!     let settings = CaptureSettings::new(0.5, 0, 0)?.acquire_timeout(Duration::from_millis(100));
//!     let capture = ScreenCapture::new(settings)?;
//!
//!     // Called On The Capture Thread For Every New Frame
//!     capture.start(30, |image| {
//!         println!("New Frame: {}x{} ({} bytes)", image.width(), image.height(), image.len());
//!     })?;
//!
//!     std::thread::sleep(Duration::from_secs(5));
//!
//!     // Stops The Capture Thread And Releases The Duplication And Devices
//!     capture.dispose()?;
//!
//!     Ok(())
//! }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::inconsistent_struct_constructor)]
#![warn(clippy::must_use_candidate)]
#![warn(clippy::ptr_as_ptr)]
#![warn(clippy::borrow_as_ptr)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

pub mod capture;
#[cfg(windows)]
pub mod com;
#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod direct2d;
#[cfg(windows)]
pub mod dxgi_duplication_api;
#[cfg(windows)]
pub mod encoder;
pub mod lifecycle;
pub mod output;
pub mod pacing;
#[cfg(windows)]
pub mod screen_capture;
#[cfg(windows)]
pub mod session;
pub mod settings;
