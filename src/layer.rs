//! Input layers and their per-frame snapshots.
//!
//! The caller owns [`HwcLayer`]s and resubmits them every frame. The queue
//! derives one [`OverlayLayer`] per visible input layer, diffing it against
//! the layer that occupied the same Z position in the previous frame. All
//! later validation and caching decisions run on those diff bits.

use std::sync::Arc;

use drm_fourcc::DrmFourcc;
use tracing::warn;

use crate::buffer::{BufferUsage, NativeHandle, OverlayBuffer, ResourceManager};
use crate::sync::SyncFence;
use crate::utils::{Rectangle, Transform};

/// Blending mode of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blending {
    /// Source pixels replace destination
    #[default]
    None,
    /// Alpha-premultiplied source over destination
    Premultiplied,
    /// Source over destination, alpha from plane alpha
    Coverage,
}

/// Client memory pixel upload, for layers without an importable native buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPixelUpload {
    /// Stable identity of the backing store
    pub id: u64,
    /// Bumped by the client whenever the pixel contents change
    pub version: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row stride in bytes
    pub stride: u32,
    /// Pixel format
    pub format: DrmFourcc,
}

/// What a layer presents this frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerContent {
    /// An importable native buffer handle
    Buffer(NativeHandle),
    /// A client memory upload
    RawPixels(RawPixelUpload),
}

/// One caller-owned input layer.
#[derive(Debug)]
pub struct HwcLayer {
    content: LayerContent,
    display_frame: Rectangle<i32>,
    source_crop: Rectangle<f32>,
    surface_damage: Rectangle<i32>,
    transform: Transform,
    blending: Blending,
    alpha: u8,
    usage: BufferUsage,
    visible: bool,
    acquire_fence: Option<SyncFence>,
    release_fence: Option<SyncFence>,
}

impl HwcLayer {
    /// Create a layer presenting a native buffer.
    pub fn new(handle: NativeHandle) -> Self {
        HwcLayer {
            content: LayerContent::Buffer(handle),
            display_frame: Rectangle::default(),
            source_crop: Rectangle::default(),
            surface_damage: Rectangle::default(),
            transform: Transform::empty(),
            blending: Blending::default(),
            alpha: 255,
            usage: BufferUsage::Normal,
            visible: true,
            acquire_fence: None,
            release_fence: None,
        }
    }

    /// Create a layer presenting client memory.
    pub fn new_raw_pixels(upload: RawPixelUpload) -> Self {
        let mut layer = HwcLayer::new(0);
        layer.content = LayerContent::RawPixels(upload);
        layer
    }

    /// Replace the presented content.
    pub fn set_content(&mut self, content: LayerContent) {
        self.content = content;
    }

    /// Destination rectangle on the display.
    pub fn set_display_frame(&mut self, frame: Rectangle<i32>) {
        self.display_frame = frame;
    }

    /// Source crop in buffer coordinates.
    pub fn set_source_crop(&mut self, crop: Rectangle<f32>) {
        self.source_crop = crop;
    }

    /// Region of the buffer that changed since the last submission.
    pub fn set_surface_damage(&mut self, damage: Rectangle<i32>) {
        self.surface_damage = damage;
    }

    /// Per-layer transform, applied before the display transform.
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Blending mode.
    pub fn set_blending(&mut self, blending: Blending) {
        self.blending = blending;
    }

    /// Plane alpha, 255 is opaque.
    pub fn set_alpha(&mut self, alpha: u8) {
        self.alpha = alpha;
    }

    /// Usage hint; drives cursor and video plane routing.
    pub fn set_usage(&mut self, usage: BufferUsage) {
        self.usage = usage;
    }

    /// Whether the layer takes part in composition at all.
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Fence that signals when the content is ready to be sampled.
    /// Ownership moves into the frame that consumes the layer.
    pub fn set_acquire_fence(&mut self, fence: SyncFence) {
        self.acquire_fence = Some(fence);
    }

    /// Take the release fence of the last committed frame, if any.
    /// The caller owns the returned duplicate.
    pub fn take_release_fence(&mut self) -> Option<SyncFence> {
        self.release_fence.take()
    }

    /// Display frame as currently set
    pub fn display_frame(&self) -> Rectangle<i32> {
        self.display_frame
    }

    /// Visibility as currently set
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn set_release_fence(&mut self, fence: Option<SyncFence>) {
        self.release_fence = fence;
    }

    pub(crate) fn take_acquire_fence(&mut self) -> Option<SyncFence> {
        self.acquire_fence.take()
    }

    /// The content the layer currently presents
    pub fn content(&self) -> &LayerContent {
        &self.content
    }
}

bitflags::bitflags! {
    /// Differences between a layer and its predecessor at the same Z.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LayerDelta: u32 {
        /// The display frame moved or resized
        const DIMENSIONS = 1 << 0;
        /// The source crop changed
        const SOURCE_RECT = 1 << 1;
        /// The presented pixels changed
        const CONTENT = 1 << 2;
        /// A raw pixel backing store changed and needs re-upload
        const RAW_PIXELS = 1 << 3;
    }
}

/// How a layer ended up realized in the committed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositionKind {
    /// Scanned out directly by a display plane
    #[default]
    Display,
    /// Rendered into an offscreen target by the GPU
    Gpu,
}

/// Per-frame snapshot of one visible input layer.
#[derive(Debug)]
pub struct OverlayLayer {
    z_order: usize,
    layer_index: usize,
    buffer: Option<Arc<OverlayBuffer>>,
    raw_pixels: Option<RawPixelUpload>,
    display_frame: Rectangle<i32>,
    source_crop: Rectangle<f32>,
    surface_damage: Rectangle<i32>,
    transform: Transform,
    blending: Blending,
    alpha: u8,
    visible: bool,
    cursor: bool,
    video: bool,
    can_scan_out: bool,
    needs_revalidation: bool,
    needs_full_draw: bool,
    delta: LayerDelta,
    acquire_fence: Option<SyncFence>,
    composition: CompositionKind,
}

impl OverlayLayer {
    /// Build the snapshot for `layer`, diffed against `previous` (the overlay
    /// layer committed at the same Z last frame).
    ///
    /// `display_frame_override` replaces the layer's own frame when the
    /// display-to-primary scaling tracker is active.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_hwc_layer(
        layer: &mut HwcLayer,
        resources: &mut ResourceManager,
        previous: Option<&OverlayLayer>,
        z_order: usize,
        layer_index: usize,
        display_frame_override: Option<Rectangle<i32>>,
        plane_transform: Transform,
        handle_constraints: bool,
    ) -> OverlayLayer {
        let display_frame = display_frame_override.unwrap_or(layer.display_frame);
        let transform = layer.transform | plane_transform;

        let mut buffer = None;
        let mut raw_pixels = None;
        let mut usage = layer.usage;
        match &layer.content {
            LayerContent::Buffer(handle) => match resources.import(*handle) {
                Ok(imported) => {
                    if usage == BufferUsage::Normal {
                        usage = imported.usage();
                    }
                    buffer = Some(imported);
                }
                Err(err) => {
                    warn!(handle, "failed to import layer buffer: {err}");
                }
            },
            LayerContent::RawPixels(upload) => raw_pixels = Some(upload.clone()),
        }

        let visible = layer.visible
            && !display_frame.is_empty()
            && (buffer.is_some() || raw_pixels.is_some());
        let cursor = usage == BufferUsage::Cursor;
        let video = usage == BufferUsage::Video;
        let can_scan_out = buffer
            .as_ref()
            .map(|b| b.scanout_capable())
            .unwrap_or(false)
            && !(handle_constraints && !transform.is_empty());

        let mut delta = LayerDelta::empty();
        let mut needs_revalidation = false;
        match previous {
            Some(prev) => {
                if display_frame != prev.display_frame {
                    delta |= LayerDelta::DIMENSIONS;
                }
                if layer.source_crop != prev.source_crop {
                    delta |= LayerDelta::SOURCE_RECT;
                }
                let content_changed = match (&buffer, &raw_pixels, &prev.buffer, &prev.raw_pixels) {
                    (Some(b), _, Some(pb), _) => b.id() != pb.id(),
                    (_, Some(raw), _, Some(praw)) => {
                        if raw.id != praw.id || raw.version != praw.version {
                            delta |= LayerDelta::RAW_PIXELS;
                            true
                        } else {
                            false
                        }
                    }
                    _ => true,
                };
                if content_changed || !layer.surface_damage.is_empty() {
                    delta |= LayerDelta::CONTENT;
                }
                needs_revalidation = transform != prev.transform
                    || layer.blending != prev.blending
                    || layer.alpha != prev.alpha
                    || can_scan_out != prev.can_scan_out;
            }
            None => {
                delta |= LayerDelta::CONTENT;
                if raw_pixels.is_some() {
                    delta |= LayerDelta::RAW_PIXELS;
                }
            }
        }

        let needs_full_draw = delta.contains(LayerDelta::RAW_PIXELS) || previous.is_none();

        // A content change without an explicit damage rect dirties the whole
        // frame; downstream damage tracking unions these rects.
        let mut surface_damage = layer.surface_damage;
        if delta.contains(LayerDelta::CONTENT) && surface_damage.is_empty() {
            surface_damage = display_frame;
        }

        OverlayLayer {
            z_order,
            layer_index,
            buffer,
            raw_pixels,
            display_frame,
            source_crop: layer.source_crop,
            surface_damage,
            transform,
            blending: layer.blending,
            alpha: layer.alpha,
            visible,
            cursor,
            video,
            can_scan_out,
            needs_revalidation,
            needs_full_draw,
            delta,
            acquire_fence: layer.take_acquire_fence(),
            composition: CompositionKind::default(),
        }
    }

    /// Z position in the visible layer list
    pub fn z_order(&self) -> usize {
        self.z_order
    }

    /// Index of the originating layer in the caller's submission
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// The imported buffer, absent for raw-pixel layers
    pub fn buffer(&self) -> Option<&Arc<OverlayBuffer>> {
        self.buffer.as_ref()
    }

    /// The raw pixel upload, if this is a raw-pixel layer
    pub fn raw_pixels(&self) -> Option<&RawPixelUpload> {
        self.raw_pixels.as_ref()
    }

    /// Destination rectangle on the display
    pub fn display_frame(&self) -> Rectangle<i32> {
        self.display_frame
    }

    /// Source crop in buffer coordinates
    pub fn source_crop(&self) -> Rectangle<f32> {
        self.source_crop
    }

    /// Damage reported for this submission
    pub fn surface_damage(&self) -> Rectangle<i32> {
        self.surface_damage
    }

    /// Combined layer and display transform
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Blending mode
    pub fn blending(&self) -> Blending {
        self.blending
    }

    /// Plane alpha
    pub fn alpha(&self) -> u8 {
        self.alpha
    }

    /// Whether the layer survives visibility culling
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Whether this is a cursor layer
    pub fn is_cursor(&self) -> bool {
        self.cursor
    }

    /// Whether this is a video layer
    pub fn is_video(&self) -> bool {
        self.video
    }

    /// Whether a plane could scan this layer out directly
    pub fn can_scan_out(&self) -> bool {
        self.can_scan_out
    }

    /// Whether plane assignment must be re-checked for this layer
    pub fn needs_revalidation(&self) -> bool {
        self.needs_revalidation
    }

    /// Whether any offscreen target showing this layer needs a full redraw
    pub fn needs_full_draw(&self) -> bool {
        self.needs_full_draw
    }

    /// Diff against the previous frame's peer
    pub fn delta(&self) -> LayerDelta {
        self.delta
    }

    /// Whether the presented pixels changed
    pub fn has_content_changed(&self) -> bool {
        self.delta.contains(LayerDelta::CONTENT)
    }

    /// Whether the display frame changed
    pub fn has_dimensions_changed(&self) -> bool {
        self.delta.contains(LayerDelta::DIMENSIONS)
    }

    /// Whether the source crop changed
    pub fn has_source_rect_changed(&self) -> bool {
        self.delta.contains(LayerDelta::SOURCE_RECT)
    }

    /// Whether raw pixel data must be re-uploaded
    pub fn raw_pixel_data_changed(&self) -> bool {
        self.delta.contains(LayerDelta::RAW_PIXELS)
    }

    /// How this layer was realized in the last committed frame
    pub fn composition(&self) -> CompositionKind {
        self.composition
    }

    pub(crate) fn set_composition(&mut self, kind: CompositionKind) {
        self.composition = kind;
    }

    /// Take the layer's acquire fence. Returns `None` if it was already
    /// consumed or never present.
    pub(crate) fn release_acquire_fence(&mut self) -> Option<SyncFence> {
        self.acquire_fence.take()
    }

    /// Acquire fence without consuming it; render backends wait on this
    /// before sampling the layer.
    pub fn acquire_fence(&self) -> Option<&SyncFence> {
        self.acquire_fence.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBufferHandler;
    use std::sync::Arc;

    fn resources() -> ResourceManager {
        ResourceManager::new(Arc::new(TestBufferHandler::default()))
    }

    fn frame(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32> {
        Rectangle::from_loc_and_size((x, y), (w, h))
    }

    fn build(layer: &mut HwcLayer, resources: &mut ResourceManager, prev: Option<&OverlayLayer>) -> OverlayLayer {
        OverlayLayer::from_hwc_layer(
            layer,
            resources,
            prev,
            prev.map(|p| p.z_order()).unwrap_or(0),
            0,
            None,
            Transform::empty(),
            false,
        )
    }

    #[test]
    fn identical_resubmission_has_no_deltas() {
        let mut resources = resources();
        let mut layer = HwcLayer::new(1);
        layer.set_display_frame(frame(0, 0, 1920, 1080));
        let first = build(&mut layer, &mut resources, None);
        let second = build(&mut layer, &mut resources, Some(&first));
        assert!(second.delta().is_empty());
        assert!(!second.needs_revalidation());
        assert!(!second.needs_full_draw());
    }

    #[test]
    fn moved_layer_sets_dimension_delta() {
        let mut resources = resources();
        let mut layer = HwcLayer::new(1);
        layer.set_display_frame(frame(0, 0, 64, 64));
        let first = build(&mut layer, &mut resources, None);
        layer.set_display_frame(frame(10, 10, 64, 64));
        let second = build(&mut layer, &mut resources, Some(&first));
        assert!(second.has_dimensions_changed());
        assert!(!second.has_content_changed());
    }

    #[test]
    fn buffer_swap_sets_content_delta() {
        let mut resources = resources();
        let mut layer = HwcLayer::new(1);
        layer.set_display_frame(frame(0, 0, 64, 64));
        let first = build(&mut layer, &mut resources, None);
        layer.set_content(LayerContent::Buffer(2));
        let second = build(&mut layer, &mut resources, Some(&first));
        assert!(second.has_content_changed());
        assert!(!second.has_dimensions_changed());
    }

    #[test]
    fn raw_pixel_version_bump_requests_upload() {
        let mut resources = resources();
        let upload = RawPixelUpload {
            id: 9,
            version: 1,
            width: 64,
            height: 64,
            stride: 256,
            format: drm_fourcc::DrmFourcc::Xrgb8888,
        };
        let mut layer = HwcLayer::new_raw_pixels(upload.clone());
        layer.set_display_frame(frame(0, 0, 64, 64));
        let first = build(&mut layer, &mut resources, None);
        assert!(!first.can_scan_out());
        let mut bumped = upload;
        bumped.version = 2;
        layer.set_content(LayerContent::RawPixels(bumped));
        let second = build(&mut layer, &mut resources, Some(&first));
        assert!(second.raw_pixel_data_changed());
        assert!(second.needs_full_draw());
    }

    #[test]
    fn empty_frame_is_invisible() {
        let mut resources = resources();
        let mut layer = HwcLayer::new(1);
        layer.set_display_frame(frame(0, 0, 0, 0));
        let overlay = build(&mut layer, &mut resources, None);
        assert!(!overlay.is_visible());
    }
}
