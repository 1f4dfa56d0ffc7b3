//! GPU composition pass.
//!
//! [`Compositor`] walks the planes that need offscreen composition and drives
//! the embedder's [`RenderBackend`] once per dirty target. The backend is
//! expected to produce an acquire fence per draw; the fence is stored on the
//! target and later distributed as the release fence of the composited layers.

use tracing::trace;

use crate::error::RenderError;
use crate::layer::{OverlayLayer, RawPixelUpload};
use crate::plane::DisplayPlaneState;
use crate::surface::{ClearKind, NativeSurface};
use crate::sync::SyncFence;
use crate::utils::{DeviceFd, Rectangle};

/// Video color tuning channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoColorControl {
    /// Luma offset
    Brightness,
    /// Luma scale
    Contrast,
    /// Chroma rotation
    Hue,
    /// Chroma scale
    Saturation,
}

/// A video color value together with its valid range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoColorValue {
    /// Current value
    pub value: f32,
    /// Lowest accepted value
    pub start: f32,
    /// Highest accepted value
    pub end: f32,
}

/// When to deinterlace video content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinterlaceFlag {
    /// Never
    None,
    /// Only when the content is flagged interlaced
    Auto,
    /// Always
    Force,
}

/// Deinterlacing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinterlaceControl {
    /// No deinterlacing
    None,
    /// Line doubling
    Bob,
    /// Field weaving
    Weave,
    /// Motion adaptive filter
    MotionAdaptive,
    /// Motion compensated filter
    MotionCompensated,
}

/// One offscreen draw handed to the render backend.
#[derive(Debug)]
pub struct CompositionPass<'a> {
    /// Target to render into
    pub target: &'a NativeSurface,
    /// Source layers, bottom to top
    pub sources: &'a [&'a OverlayLayer],
    /// Display-space region covered by the target's plane
    pub viewport: Rectangle<i32>,
    /// How much of the target must be repainted
    pub clear: ClearKind,
    /// Accumulated damage when `clear` is partial
    pub damage: Rectangle<i32>,
    /// Whether video color effects apply to this pass
    pub apply_effects: bool,
}

/// GPU rasterizer provided by the embedder.
pub trait RenderBackend: Send {
    /// Bind the backend to the device. Called once per power-on.
    fn init(&mut self, gpu_fd: &DeviceFd) -> Result<(), RenderError>;

    /// Start a composition frame.
    fn begin_frame(&mut self, disable_explicit_sync: bool) -> Result<(), RenderError>;

    /// Render one offscreen target. Returns the acquire fence of the draw,
    /// if the backend produces one.
    fn draw(&mut self, pass: CompositionPass<'_>) -> Result<Option<SyncFence>, RenderError>;

    /// Re-upload changed raw pixel backing stores.
    fn upload_raw_pixels(&mut self, uploads: &[RawPixelUpload]) -> Result<(), RenderError>;

    /// Flush uploads queued by [`upload_raw_pixels`](Self::upload_raw_pixels)
    /// when no draw consumes them this frame.
    fn flush_uploads(&mut self) -> Result<(), RenderError>;

    /// Set one video color channel.
    fn set_video_color(&mut self, control: VideoColorControl, value: f32);

    /// Read back one video color channel with its range.
    fn video_color(&self, control: VideoColorControl) -> VideoColorValue;

    /// Restore one video color channel to its default.
    fn restore_video_default_color(&mut self, control: VideoColorControl);

    /// Configure deinterlacing.
    fn set_video_deinterlace(&mut self, flag: DeinterlaceFlag, mode: DeinterlaceControl);

    /// Restore default deinterlacing.
    fn restore_video_default_deinterlace(&mut self);

    /// Select the video scaling filter.
    fn set_video_scaling_mode(&mut self, mode: u32);

    /// Drop all device resources.
    fn reset(&mut self);
}

impl std::fmt::Debug for dyn RenderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RenderBackend")
    }
}

/// Drives the render backend for the offscreen-composed planes of a frame.
#[derive(Debug)]
pub struct Compositor {
    backend: Box<dyn RenderBackend>,
    initialized: bool,
}

impl Compositor {
    /// Wrap the embedder's render backend.
    pub fn new(backend: Box<dyn RenderBackend>) -> Self {
        Compositor {
            backend,
            initialized: false,
        }
    }

    /// Bind the backend to the device, once.
    pub fn init(&mut self, gpu_fd: &DeviceFd) -> Result<(), RenderError> {
        if self.initialized {
            return Ok(());
        }
        self.backend.init(gpu_fd)?;
        self.initialized = true;
        Ok(())
    }

    /// Start a composition frame.
    pub fn begin_frame(&mut self, disable_explicit_sync: bool) -> Result<(), RenderError> {
        if !self.initialized {
            return Err(RenderError::BadFrame);
        }
        self.backend.begin_frame(disable_explicit_sync)
    }

    /// Render every dirty offscreen target of `planes`.
    ///
    /// `display_frame_rects` carries the display frame of each layer in
    /// `layers`, in the same order.
    pub fn draw(
        &mut self,
        planes: &mut [DisplayPlaneState],
        layers: &[OverlayLayer],
        display_frame_rects: &[Rectangle<i32>],
    ) -> Result<(), RenderError> {
        for state in planes
            .iter_mut()
            .filter(|s| s.needs_offscreen_composition() && !s.surface_recycled())
        {
            let target = match state.offscreen_target() {
                Some(target) => target.clone(),
                None => continue,
            };
            let sources: Vec<&OverlayLayer> =
                state.source_layers().iter().map(|i| &layers[*i]).collect();
            let viewport = state
                .source_layers()
                .iter()
                .map(|i| display_frame_rects[*i])
                .fold(Rectangle::default(), Rectangle::merge);
            let (clear, damage) = target.take_frame_state();
            trace!(
                plane = state.plane().id(),
                sources = sources.len(),
                ?clear,
                "compositing offscreen target"
            );
            let fence = self.backend.draw(CompositionPass {
                target: &target,
                sources: &sources,
                viewport,
                clear,
                damage,
                apply_effects: state.apply_effects(),
            })?;
            target.set_acquire_fence(fence);
        }
        Ok(())
    }

    /// Queue re-uploads for changed raw pixel layers.
    pub fn update_layer_pixel_data(&mut self, layers: &[OverlayLayer]) -> Result<(), RenderError> {
        let uploads: Vec<RawPixelUpload> = layers
            .iter()
            .filter(|l| l.raw_pixel_data_changed())
            .filter_map(|l| l.raw_pixels().cloned())
            .collect();
        if uploads.is_empty() {
            return Ok(());
        }
        self.backend.upload_raw_pixels(&uploads)
    }

    /// Flush queued uploads when the frame ends without a composition pass.
    pub fn ensure_pixel_data_updated(&mut self) -> Result<(), RenderError> {
        self.backend.flush_uploads()
    }

    /// Drop device resources. The next power-on re-initializes the backend.
    pub fn reset(&mut self) {
        self.backend.reset();
        self.initialized = false;
    }

    /// See [`RenderBackend::set_video_color`].
    pub fn set_video_color(&mut self, control: VideoColorControl, value: f32) {
        self.backend.set_video_color(control, value);
    }

    /// See [`RenderBackend::video_color`].
    pub fn video_color(&self, control: VideoColorControl) -> VideoColorValue {
        self.backend.video_color(control)
    }

    /// See [`RenderBackend::restore_video_default_color`].
    pub fn restore_video_default_color(&mut self, control: VideoColorControl) {
        self.backend.restore_video_default_color(control);
    }

    /// See [`RenderBackend::set_video_deinterlace`].
    pub fn set_video_deinterlace(&mut self, flag: DeinterlaceFlag, mode: DeinterlaceControl) {
        self.backend.set_video_deinterlace(flag, mode);
    }

    /// See [`RenderBackend::restore_video_default_deinterlace`].
    pub fn restore_video_default_deinterlace(&mut self) {
        self.backend.restore_video_default_deinterlace();
    }

    /// See [`RenderBackend::set_video_scaling_mode`].
    pub fn set_video_scaling_mode(&mut self, mode: u32) {
        self.backend.set_video_scaling_mode(mode);
    }
}
