#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
//! **scanout: a per-display composition pipeline**
//!
//! Given the Z-ordered layer stack destined for one physical display, this
//! crate decides how the stack is realized by the display controller: which
//! hardware planes scan application buffers out directly, which layers are
//! composited into offscreen targets by the GPU first, and it drives the
//! resulting plane configuration into the kernel driver once per refresh.
//!
//! The central type is [`DisplayQueue`]. It caches the plane assignment of
//! the previous frame and patches it incrementally when only content or
//! geometry changed, falling back to full re-validation through the
//! [`plane::DisplayPlaneManager`] when the stack shape changes, a commit
//! fails or the configuration moves under it. Offscreen render targets
//! rotate through small per-plane sets and are aged, recycled and released
//! as the stack settles.
//!
//! Everything hardware- and platform-specific sits behind traits the
//! embedder implements: the kernel adapter ([`display::PhysicalDisplay`]),
//! the WSI buffer backend ([`buffer::NativeBufferHandler`]), the plane
//! capability oracle ([`plane::PlaneHandler`]) and the GPU rasterizer
//! ([`compositor::RenderBackend`]).
//!
//! Fences are linear resources throughout: a [`sync::SyncFence`] owns its
//! fd, broadcast duplicates are explicit, and the single wait on the kms
//! out-fence sits before the following commit (or after the current one with
//! the `double-buffering` feature).

pub mod buffer;
pub mod compositor;
pub mod display;
pub mod error;
pub mod layer;
pub mod plane;
pub mod queue;
pub mod surface;
pub mod sync;
pub mod utils;
pub mod vblank;

#[cfg(test)]
pub(crate) mod test_utils;

pub use buffer::{NativeBufferHandler, ResourceManager};
pub use display::{PhysicalDisplay, PowerMode};
pub use layer::HwcLayer;
pub use queue::{DisplayQueue, QueueHandle, IDLE_FRAMES};
pub use sync::SyncFence;
