//! Vsync callback delivery.
//!
//! The embedder's dispatcher thread owns the actual vblank event source and
//! calls [`VblankEventHandler::handle_vblank`] when the pipe flips. The
//! handler is just the gate: callbacks only fire while the display is powered
//! on and vsync delivery is enabled.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::display::PowerMode;
use crate::utils::DeviceFd;

/// Vsync callback: `(display_id, timestamp_ns)`.
pub type VsyncCallback = Box<dyn FnMut(u32, i64) + Send>;

#[derive(Debug, Default)]
struct VblankInner {
    power_mode: Option<PowerMode>,
    enabled: bool,
    display_id: u32,
    pipe: u32,
    fd: Option<DeviceFd>,
    callback: Option<CallbackSlot>,
}

struct CallbackSlot(VsyncCallback);

impl std::fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VsyncCallback")
    }
}

/// Power-gated vsync callback dispatcher for one pipe.
///
/// Cloning yields another handle onto the same state, so a dispatcher thread
/// can hold one while the queue owns another.
#[derive(Debug, Clone, Default)]
pub struct VblankEventHandler {
    inner: Arc<Mutex<VblankInner>>,
}

impl VblankEventHandler {
    /// Create the handler in the powered-off state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the handler to a device and pipe.
    pub fn init(&self, fd: DeviceFd, pipe: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.fd = Some(fd);
        inner.pipe = pipe;
    }

    /// Gate callback delivery on the display power mode.
    pub fn set_power_mode(&self, mode: PowerMode) {
        let mut inner = self.inner.lock().unwrap();
        trace!(pipe = inner.pipe, ?mode, "vblank power mode");
        inner.power_mode = Some(mode);
    }

    /// Register the vsync consumer.
    pub fn register_callback(&self, callback: VsyncCallback, display_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.callback = Some(CallbackSlot(callback));
        inner.display_id = display_id;
    }

    /// Enable or disable vsync delivery.
    pub fn vsync_control(&self, enabled: bool) {
        self.inner.lock().unwrap().enabled = enabled;
    }

    /// Deliver one vblank event. Returns whether a callback fired.
    pub fn handle_vblank(&self, timestamp_ns: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled || inner.power_mode != Some(PowerMode::On) {
            return false;
        }
        let display_id = inner.display_id;
        if let Some(CallbackSlot(callback)) = inner.callback.as_mut() {
            callback(display_id, timestamp_ns);
            true
        } else {
            false
        }
    }
}
