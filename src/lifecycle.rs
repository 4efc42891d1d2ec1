//! Scoped ownership of long-lived GPU and duplication handles.
//!
//! COM interfaces release their reference when dropped, which on its own gives no control
//! over the order in which a device and the objects created from it go away. [`Resource`]
//! wraps a handle so the owner can release it explicitly, in dependency order, any number
//! of times without releasing it twice.
use log::trace;

/// Used To Handle Resource Lifecycle Errors
#[derive(thiserror::Error, Eq, PartialEq, Clone, Copy, Debug)]
pub enum Error {
    #[error("{0} has already been released")]
    Released(&'static str),
}

/// A named handle that can be released exactly once.
#[derive(Debug)]
pub struct Resource<T> {
    name: &'static str,
    inner: Option<T>,
}

impl<T> Resource<T> {
    /// Takes ownership of `inner`.
    #[inline]
    #[must_use]
    pub const fn new(name: &'static str, inner: T) -> Self {
        Self { name, inner: Some(inner) }
    }

    /// Name used in logs and errors.
    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Borrows the handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Released`] once [`Resource::release`] has run.
    #[inline]
    pub const fn get(&self) -> Result<&T, Error> {
        match &self.inner {
            Some(inner) => Ok(inner),
            None => Err(Error::Released(self.name)),
        }
    }

    /// Mutably borrows the handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Released`] once [`Resource::release`] has run.
    #[inline]
    pub const fn get_mut(&mut self) -> Result<&mut T, Error> {
        match &mut self.inner {
            Some(inner) => Ok(inner),
            None => Err(Error::Released(self.name)),
        }
    }

    /// Replaces the handle, dropping the previous one first.
    #[inline]
    pub fn replace(&mut self, inner: T) {
        self.release();
        self.inner = Some(inner);
    }

    /// Drops the handle. Returns `false` if it was already released.
    #[inline]
    pub fn release(&mut self) -> bool {
        match self.inner.take() {
            Some(inner) => {
                drop(inner);
                trace!("Released {}", self.name);
                true
            }
            None => false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.inner.is_none()
    }
}

/// Releases every resource in the order given, skipping ones already released.
///
/// Returns how many resources this call actually released.
#[macro_export]
macro_rules! release_in_order {
    ($($resource:expr),+ $(,)?) => {{
        let mut released = 0usize;
        $(
            if $resource.release() {
                released += 1;
            }
        )+
        released
    }};
}
