use std::marker::PhantomData;

use log::{trace, warn};
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{
    CO_MTA_USAGE_COOKIE, COINIT_MULTITHREADED, CoDecrementMTAUsage, CoIncrementMTAUsage, CoInitializeEx,
    CoUninitialize,
};

/// Keeps the process multithreaded apartment alive while held.
///
/// Threads that never initialize COM themselves then run in the implicit multithreaded
/// apartment. The cookie may be dropped on any thread.
pub struct MtaUsage {
    cookie: CO_MTA_USAGE_COOKIE,
}

// SAFETY: the cookie is an opaque token that CoDecrementMTAUsage accepts on any thread.
unsafe impl Send for MtaUsage {}

impl MtaUsage {
    /// Increments the process MTA usage.
    ///
    /// # Errors
    ///
    /// Returns the `CoIncrementMTAUsage` failure.
    #[inline]
    pub fn new() -> Result<Self, windows::core::Error> {
        Ok(Self { cookie: unsafe { CoIncrementMTAUsage()? } })
    }
}

impl Drop for MtaUsage {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CoDecrementMTAUsage(self.cookie) } {
            warn!("Failed to decrement MTA usage: {e}");
        }
    }
}

/// Joins the current thread to the multithreaded apartment until dropped.
///
/// Must be dropped on the thread that created it.
pub struct Apartment {
    initialized: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl Apartment {
    /// Calls `CoInitializeEx` with `COINIT_MULTITHREADED` on the current thread.
    ///
    /// A thread already in a single-threaded apartment stays there and nothing is undone on
    /// drop.
    #[must_use]
    pub fn multithreaded() -> Self {
        let result = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };

        if result == RPC_E_CHANGED_MODE {
            warn!("Thread is already in a single-threaded apartment, keeping it");
        } else if let Err(e) = result.ok() {
            warn!("Failed to initialize COM on this thread: {e}");
        } else {
            trace!("Joined the multithreaded apartment");
        }

        Self { initialized: result.is_ok(), _thread_bound: PhantomData }
    }

    /// Whether this guard initialized COM and will uninitialize it on drop.
    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Drop for Apartment {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { CoUninitialize() };
        }
    }
}
