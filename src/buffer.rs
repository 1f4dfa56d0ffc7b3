//! Buffer import and scan-out framebuffer management.
//!
//! The WSI layer hands the pipeline opaque native handles. [`ResourceManager`]
//! imports them through the embedder-provided [`NativeBufferHandler`] and caches
//! the resulting [`OverlayBuffer`]s so repeated submissions of the same handle
//! hit the same framebuffer object.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use drm_fourcc::DrmFourcc;
use tracing::{trace, warn};

use crate::error::BufferError;
use crate::utils::DeviceFd;

/// Opaque WSI buffer handle, owned by the caller.
pub type NativeHandle = u64;

static ALLOCATED_BUFFER_IDS: AtomicU64 = AtomicU64::new(1 << 48);

/// Usage class of a buffer or layer, as hinted by the WSI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferUsage {
    /// Regular application content
    #[default]
    Normal,
    /// Cursor sprite
    Cursor,
    /// Video/media content
    Video,
}

/// Description of one imported or allocated buffer, as reported by the
/// [`NativeBufferHandler`].
#[derive(Debug)]
pub struct BufferDescriptor {
    /// Native handle this buffer was imported from, `None` for pipeline-allocated
    /// offscreen targets
    pub handle: Option<NativeHandle>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub format: DrmFourcc,
    /// dma-buf fd of the underlying allocation, if it can be exported
    pub prime_fd: Option<std::os::unix::io::OwnedFd>,
    /// Per-plane row pitches
    pub pitches: [u32; 4],
    /// Per-plane byte offsets
    pub offsets: [u32; 4],
    /// Per-plane GEM handles
    pub gem_handles: [u32; 4],
    /// Number of planes in the buffer
    pub num_planes: u32,
    /// Usage class
    pub usage: BufferUsage,
    /// Whether the buffer can be realized as a scan-out framebuffer at all
    pub scanout_capable: bool,
}

/// Buffer backend provided by the embedder (the WSI layer).
pub trait NativeBufferHandler: Send + Sync {
    /// Import a native handle, resolving it to a buffer description.
    fn import_buffer(&self, handle: NativeHandle) -> Result<BufferDescriptor, BufferError>;

    /// Allocate a buffer suitable as an offscreen render target.
    fn allocate_buffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
    ) -> Result<BufferDescriptor, BufferError>;

    /// Realize a scan-out framebuffer object for `buffer`.
    fn create_frame_buffer(
        &self,
        buffer: &BufferDescriptor,
        gpu_fd: &DeviceFd,
    ) -> Result<NonZeroU32, BufferError>;

    /// Destroy a framebuffer object previously created by
    /// [`create_frame_buffer`](Self::create_frame_buffer).
    fn release_frame_buffer(&self, fb: NonZeroU32);

    /// Release an imported or allocated buffer.
    fn release_buffer(&self, buffer: &BufferDescriptor);
}

/// One source buffer wrapped for use by the pipeline.
///
/// The framebuffer object is created lazily on the first frame that actually
/// scans the buffer out; GPU-composited buffers never pay for one.
#[derive(Debug)]
pub struct OverlayBuffer {
    id: u64,
    desc: BufferDescriptor,
    handler: Arc<dyn NativeBufferHandler>,
    fb: AtomicU32,
}

impl OverlayBuffer {
    fn new(desc: BufferDescriptor, handler: Arc<dyn NativeBufferHandler>) -> Self {
        let id = match desc.handle {
            Some(handle) => handle,
            None => ALLOCATED_BUFFER_IDS.fetch_add(1, Ordering::Relaxed),
        };
        OverlayBuffer {
            id,
            desc,
            handler,
            fb: AtomicU32::new(0),
        }
    }

    /// Stable identity of the buffer contents; two frames presenting the same
    /// native handle see the same id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.desc.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.desc.height
    }

    /// Pixel format
    pub fn format(&self) -> DrmFourcc {
        self.desc.format
    }

    /// Usage class reported at import time
    pub fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    /// Whether the buffer can be realized as a scan-out framebuffer
    pub fn scanout_capable(&self) -> bool {
        self.desc.scanout_capable
    }

    /// Buffer description as imported
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.desc
    }

    /// The realized framebuffer object, if any.
    pub fn framebuffer(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.fb.load(Ordering::Acquire))
    }

    /// Create the scan-out framebuffer object if it does not exist yet.
    pub fn ensure_framebuffer(&self, gpu_fd: &DeviceFd) -> Result<NonZeroU32, BufferError> {
        if let Some(fb) = self.framebuffer() {
            return Ok(fb);
        }
        let fb = self.handler.create_frame_buffer(&self.desc, gpu_fd)?;
        self.fb.store(fb.get(), Ordering::Release);
        trace!(buffer = self.id, fb = fb.get(), "created framebuffer object");
        Ok(fb)
    }
}

impl Drop for OverlayBuffer {
    fn drop(&mut self) {
        if let Some(fb) = NonZeroU32::new(self.fb.load(Ordering::Acquire)) {
            self.handler.release_frame_buffer(fb);
        }
        self.handler.release_buffer(&self.desc);
    }
}

/// Owns all imported buffers of one display queue.
#[derive(Debug)]
pub struct ResourceManager {
    handler: Arc<dyn NativeBufferHandler>,
    imported: HashMap<NativeHandle, Arc<OverlayBuffer>>,
}

impl std::fmt::Debug for dyn NativeBufferHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NativeBufferHandler")
    }
}

impl ResourceManager {
    /// Create a resource manager on top of the embedder's buffer backend.
    pub fn new(handler: Arc<dyn NativeBufferHandler>) -> Self {
        ResourceManager {
            handler,
            imported: HashMap::new(),
        }
    }

    /// Import `handle`, reusing the cached import when the same handle was
    /// seen before.
    pub fn import(&mut self, handle: NativeHandle) -> Result<Arc<OverlayBuffer>, BufferError> {
        if let Some(buffer) = self.imported.get(&handle) {
            return Ok(buffer.clone());
        }
        let desc = self.handler.import_buffer(handle)?;
        let buffer = Arc::new(OverlayBuffer::new(desc, self.handler.clone()));
        self.imported.insert(handle, buffer.clone());
        Ok(buffer)
    }

    /// Allocate a fresh offscreen render target buffer.
    pub fn allocate_surface_buffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
    ) -> Result<Arc<OverlayBuffer>, BufferError> {
        let desc = self.handler.allocate_buffer(width, height, format)?;
        Ok(Arc::new(OverlayBuffer::new(desc, self.handler.clone())))
    }

    /// Drop every cached import. Buffers still referenced by in-flight layers
    /// survive until those references drop.
    pub fn purge(&mut self) {
        let still_shared = self
            .imported
            .values()
            .filter(|b| Arc::strong_count(b) > 1)
            .count();
        if still_shared > 0 {
            warn!(count = still_shared, "purging buffers that are still referenced");
        }
        self.imported.clear();
    }
}
