use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use crate::error::CapabilityError;

/// Exclusive claim on the camera. Only one lease exists per slot at a time.
#[derive(Debug, Clone, Default)]
pub struct CameraSlot {
    held: Arc<AtomicBool>,
}

impl CameraSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide slot shared by every detector that does not bring its own.
    pub fn global() -> CameraSlot {
        static GLOBAL: OnceLock<CameraSlot> = OnceLock::new();
        GLOBAL.get_or_init(CameraSlot::new).clone()
    }

    /// Fails fast with `Busy` if someone else already holds the camera.
    pub fn try_claim(&self) -> Result<CameraLease, CapabilityError> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| CameraLease {
                held: self.held.clone(),
            })
            .map_err(|_| CapabilityError::Busy)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Released when dropped, on every exit path.
#[derive(Debug)]
pub struct CameraLease {
    held: Arc<AtomicBool>,
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
