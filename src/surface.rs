//! Offscreen render targets.
//!
//! Planes that composite several layers on the GPU rotate through a small set
//! of [`NativeSurface`]s. The age counter encodes how many frames ago a
//! surface was scanned out; it drives both the in-plane rotation and the
//! deferred recycling queues of the display queue.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::OverlayBuffer;
use crate::sync::SyncFence;
use crate::utils::Rectangle;

/// How much of a surface the next draw has to repaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearKind {
    /// The surface content is valid, repaint only recorded damage
    #[default]
    None,
    /// Repaint the damage region over valid content
    Partial,
    /// Discard and repaint everything
    Full,
}

#[derive(Debug, Default)]
struct FrameState {
    clear: ClearKind,
    damage: Rectangle<i32>,
}

/// One offscreen render target.
///
/// Shared between the plane state that scans it out, the plane manager's pool
/// and the recycling queues; all mutable state is interior.
#[derive(Debug)]
pub struct NativeSurface {
    buffer: Arc<OverlayBuffer>,
    age: AtomicI32,
    in_use: AtomicBool,
    frame: Mutex<FrameState>,
    acquire_fence: Mutex<Option<SyncFence>>,
}

/// Shared handle to a [`NativeSurface`].
pub type SurfaceHandle = Arc<NativeSurface>;

impl NativeSurface {
    /// Wrap a freshly allocated buffer as a render target. New surfaces start
    /// with a pending full clear.
    pub fn new(buffer: Arc<OverlayBuffer>) -> Self {
        NativeSurface {
            buffer,
            age: AtomicI32::new(0),
            in_use: AtomicBool::new(false),
            frame: Mutex::new(FrameState {
                clear: ClearKind::Full,
                damage: Rectangle::default(),
            }),
            acquire_fence: Mutex::new(None),
        }
    }

    /// Backing buffer of the target
    pub fn buffer(&self) -> &Arc<OverlayBuffer> {
        &self.buffer
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Frames since this surface was last scanned out; negative means
    /// scheduled for release.
    pub fn age(&self) -> i32 {
        self.age.load(Ordering::Acquire)
    }

    /// Set the age counter.
    pub fn set_age(&self, age: i32) {
        self.age.store(age, Ordering::Release);
    }

    /// Whether a plane currently holds this surface.
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }

    /// Request a full repaint on the next draw.
    pub fn mark_full_clear(&self) {
        let mut frame = self.frame.lock().unwrap();
        frame.clear = ClearKind::Full;
        frame.damage = Rectangle::default();
    }

    /// Accumulate damage for the next draw.
    pub fn record_damage(&self, damage: Rectangle<i32>) {
        let mut frame = self.frame.lock().unwrap();
        if frame.clear == ClearKind::Full {
            return;
        }
        frame.clear = ClearKind::Partial;
        frame.damage = frame.damage.merge(damage);
    }

    /// Consume the pending repaint request for the draw that is about to run.
    pub fn take_frame_state(&self) -> (ClearKind, Rectangle<i32>) {
        let mut frame = self.frame.lock().unwrap();
        let state = (frame.clear, frame.damage);
        frame.clear = ClearKind::None;
        frame.damage = Rectangle::default();
        state
    }

    /// Store the acquire fence produced by the GPU draw into this target.
    pub fn set_acquire_fence(&self, fence: Option<SyncFence>) {
        *self.acquire_fence.lock().unwrap() = fence;
    }

    /// Take the acquire fence of the most recent draw, if it has not been
    /// consumed yet.
    pub fn take_acquire_fence(&self) -> Option<SyncFence> {
        self.acquire_fence.lock().unwrap().take()
    }
}
