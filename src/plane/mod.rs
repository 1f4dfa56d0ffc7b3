//! Display planes and per-frame plane assignments.
//!
//! A [`DisplayPlane`] is one scan-out engine of the display controller. A
//! [`DisplayPlaneState`] is one slot of the frame's plane configuration: the
//! plane, the source layers it realizes and, when those layers are composited
//! on the GPU first, the offscreen targets it scans out instead.

use std::sync::Arc;

use drm_fourcc::DrmFourcc;

use crate::buffer::OverlayBuffer;
use crate::layer::OverlayLayer;
use crate::surface::{ClearKind, SurfaceHandle};
use crate::utils::Rectangle;

mod manager;
pub use manager::{DisplayPlaneManager, PlaneHandler};

/// Hardware class of a display plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    /// The plane that must always carry a buffer while the pipe is active
    Primary,
    /// An additional overlay engine
    Overlay,
    /// The cursor sprite plane
    Cursor,
}

/// One scan-out engine, as reported by the [`PlaneHandler`].
#[derive(Debug)]
pub struct DisplayPlane {
    id: u32,
    plane_type: PlaneType,
    formats: Vec<DrmFourcc>,
}

/// Shared reference to a [`DisplayPlane`].
pub type PlaneRef = Arc<DisplayPlane>;

impl DisplayPlane {
    /// Describe a plane by its kernel object id, class and supported formats.
    pub fn new(id: u32, plane_type: PlaneType, formats: Vec<DrmFourcc>) -> Self {
        DisplayPlane {
            id,
            plane_type,
            formats,
        }
    }

    /// Kernel object id of the plane
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hardware class
    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    /// Whether the plane supports scanning out `format`
    pub fn supports_format(&self, format: DrmFourcc) -> bool {
        self.formats.iter().any(|f| *f == format)
    }
}

bitflags::bitflags! {
    /// Pending re-validation checks on a plane assignment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RevalidationType: u32 {
        /// The scanout-vs-composition decision may be stale
        const SCANOUT = 1 << 0;
        /// Plane scaling limits may be exceeded
        const SCALING = 1 << 1;
    }
}

/// How a plane slot is realized, for dispatch over the closed set of kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneRole {
    /// One layer scanned out directly
    Scanout,
    /// Several layers composited into an offscreen target first
    OffscreenComposed,
    /// The cursor sprite
    Cursor,
    /// Video content, possibly with color effects applied on the GPU
    Video,
}

/// One slot of a frame's plane configuration.
#[derive(Debug)]
pub struct DisplayPlaneState {
    plane: PlaneRef,
    source_layers: Vec<usize>,
    surfaces: Vec<SurfaceHandle>,
    scanout_buffer: Option<Arc<OverlayBuffer>>,
    display_frame: Rectangle<i32>,
    source_crop: Rectangle<f32>,
    damage: Rectangle<i32>,
    needs_offscreen: bool,
    cursor_plane: bool,
    video_plane: bool,
    apply_effects: bool,
    recycled_surface: bool,
    revalidation: RevalidationType,
}

impl DisplayPlaneState {
    /// Create a slot scanning `layer` out directly on `plane`.
    pub fn new_scanout(plane: PlaneRef, layer: &OverlayLayer) -> Self {
        let cursor_plane = plane.plane_type() == PlaneType::Cursor;
        DisplayPlaneState {
            plane,
            source_layers: vec![layer.z_order()],
            surfaces: Vec::new(),
            scanout_buffer: layer.buffer().cloned(),
            display_frame: layer.display_frame(),
            source_crop: layer.source_crop(),
            damage: layer.display_frame(),
            needs_offscreen: false,
            cursor_plane,
            video_plane: layer.is_video(),
            apply_effects: false,
            recycled_surface: false,
            revalidation: RevalidationType::empty(),
        }
    }

    /// Create a slot compositing `layer` (and any layers added later) into an
    /// offscreen target scanned out by `plane`.
    pub fn new_offscreen(plane: PlaneRef, layer: &OverlayLayer) -> Self {
        let mut state = DisplayPlaneState::new_scanout(plane, layer);
        state.needs_offscreen = true;
        state.scanout_buffer = None;
        state
    }

    /// Duplicate the committed state of the previous frame as the starting
    /// point for this frame's incremental update.
    pub fn copy_state(&self) -> Self {
        DisplayPlaneState {
            plane: self.plane.clone(),
            source_layers: self.source_layers.clone(),
            surfaces: self.surfaces.clone(),
            scanout_buffer: self.scanout_buffer.clone(),
            display_frame: self.display_frame,
            source_crop: self.source_crop,
            damage: Rectangle::default(),
            needs_offscreen: self.needs_offscreen,
            cursor_plane: self.cursor_plane,
            video_plane: self.video_plane,
            apply_effects: self.apply_effects,
            // Until something dirties this plane the previously rendered
            // target keeps being scanned out as-is.
            recycled_surface: !self.surfaces.is_empty(),
            revalidation: RevalidationType::empty(),
        }
    }

    /// The hardware plane of this slot
    pub fn plane(&self) -> &PlaneRef {
        &self.plane
    }

    /// Ordered source layer indices realized by this slot
    pub fn source_layers(&self) -> &[usize] {
        &self.source_layers
    }

    /// Topmost source layer index
    pub fn top_source_layer(&self) -> usize {
        *self.source_layers.last().expect("plane state without source layers")
    }

    /// Drop all source layers at or above `threshold`.
    pub fn reset_layers(&mut self, threshold: usize) {
        self.source_layers.retain(|idx| *idx < threshold);
        self.recycled_surface = false;
    }

    /// Add another source layer; the slot switches to offscreen composition
    /// if it now carries more than one.
    pub fn add_layer(&mut self, layer: &OverlayLayer) {
        self.source_layers.push(layer.z_order());
        self.display_frame = self.display_frame.merge(layer.display_frame());
        if self.source_layers.len() > 1 {
            self.needs_offscreen = true;
            self.scanout_buffer = None;
        }
        if layer.is_video() {
            self.video_plane = true;
        }
        self.recycled_surface = false;
    }

    /// Point a scanout slot at (a possibly new revision of) its layer.
    pub fn set_overlay_layer(&mut self, layer: &OverlayLayer) {
        debug_assert!(!self.needs_offscreen);
        self.scanout_buffer = layer.buffer().cloned();
        self.display_frame = layer.display_frame();
        self.source_crop = layer.source_crop();
    }

    /// Whether the slot composites its layers on the GPU first
    pub fn needs_offscreen_composition(&self) -> bool {
        self.needs_offscreen
    }

    /// Whether the slot scans a client buffer out directly
    pub fn scanout(&self) -> bool {
        !self.needs_offscreen
    }

    /// Force the slot onto the offscreen composition path.
    pub fn set_needs_offscreen_composition(&mut self) {
        self.needs_offscreen = true;
        self.scanout_buffer = None;
        self.recycled_surface = false;
    }

    /// Switch the slot back to scanning `layer` out directly.
    pub fn set_scanout(&mut self, layer: &OverlayLayer) {
        self.needs_offscreen = false;
        self.set_overlay_layer(layer);
    }

    /// Whether this is the cursor plane slot
    pub fn is_cursor_plane(&self) -> bool {
        self.cursor_plane
    }

    /// Whether this slot carries video content
    pub fn is_video_plane(&self) -> bool {
        self.video_plane
    }

    /// Whether GPU color effects are applied to this slot's video content
    pub fn apply_effects(&self) -> bool {
        self.apply_effects
    }

    /// Toggle GPU color effects for this slot.
    pub fn set_apply_effects(&mut self, apply: bool) {
        self.apply_effects = apply;
        if apply {
            self.recycled_surface = false;
        }
    }

    /// Offscreen targets owned by this slot
    pub fn surfaces(&self) -> &[SurfaceHandle] {
        &self.surfaces
    }

    /// The offscreen target currently scanned out, if any
    pub fn offscreen_target(&self) -> Option<&SurfaceHandle> {
        self.surfaces.first()
    }

    /// Whether the slot needs an offscreen target it does not have yet
    pub fn needs_surface_allocation(&self) -> bool {
        self.needs_offscreen && self.surfaces.is_empty()
    }

    /// Whether the previously rendered target is reused without a redraw
    pub fn surface_recycled(&self) -> bool {
        self.recycled_surface
    }

    pub(crate) fn set_surface_recycled(&mut self, recycled: bool) {
        self.recycled_surface = recycled;
    }

    pub(crate) fn push_surface(&mut self, surface: SurfaceHandle) {
        surface.set_in_use(true);
        surface.set_age(0);
        self.surfaces.insert(0, surface);
        self.sync_scanout_buffer();
        self.recycled_surface = false;
    }

    /// Rotate the least recently drawn target to the front so the next draw
    /// renders into it.
    pub(crate) fn rotate_surfaces(&mut self) {
        if self.surfaces.len() > 1 {
            let oldest = self.surfaces.pop().expect("surfaces checked non-empty");
            self.surfaces.insert(0, oldest);
            self.sync_scanout_buffer();
        }
    }

    pub(crate) fn take_surfaces(&mut self) -> Vec<SurfaceHandle> {
        for surface in &self.surfaces {
            surface.set_in_use(false);
        }
        self.recycled_surface = true;
        std::mem::take(&mut self.surfaces)
    }

    fn sync_scanout_buffer(&mut self) {
        self.scanout_buffer = self.surfaces.first().map(|s| s.buffer().clone());
    }

    /// The buffer the plane will present: the client buffer for scanout slots,
    /// the front offscreen target otherwise.
    pub fn scanout_buffer(&self) -> Option<&Arc<OverlayBuffer>> {
        self.scanout_buffer.as_ref()
    }

    /// Union of display frames of the slot's source layers
    pub fn display_frame(&self) -> Rectangle<i32> {
        self.display_frame
    }

    /// Source crop of the scanned out buffer
    pub fn source_crop(&self) -> Rectangle<f32> {
        self.source_crop
    }

    /// Damage accumulated for this frame
    pub fn damage(&self) -> Rectangle<i32> {
        self.damage
    }

    /// Fold an updated layer display frame into the slot.
    pub fn update_display_frame(&mut self, frame: Rectangle<i32>, full_draw: bool) {
        self.display_frame = self.display_frame.merge(frame);
        if full_draw {
            self.refresh_surfaces(ClearKind::Full, true);
        }
        self.recycled_surface = false;
    }

    /// Fold an updated source crop into the slot.
    pub fn update_source_crop(&mut self, crop: Rectangle<f32>, full_draw: bool) {
        self.source_crop = crop;
        if full_draw {
            self.refresh_surfaces(ClearKind::Full, true);
        }
        self.recycled_surface = false;
    }

    /// Request a repaint of all targets of the slot.
    pub fn refresh_surfaces(&mut self, clear: ClearKind, _refresh: bool) {
        for surface in &self.surfaces {
            match clear {
                ClearKind::Full => surface.mark_full_clear(),
                ClearKind::Partial | ClearKind::None => {
                    surface.record_damage(self.display_frame)
                }
            }
        }
        self.recycled_surface = false;
    }

    /// Accumulate damage and forward it to the targets.
    pub fn update_damage(&mut self, damage: Rectangle<i32>) {
        self.damage = self.damage.merge(damage);
        for surface in &self.surfaces {
            surface.record_damage(damage);
        }
        self.recycled_surface = false;
    }

    /// Take the acquire fence of the front target's latest draw.
    pub fn composition_fence(&self) -> Option<crate::sync::SyncFence> {
        self.surfaces.first().and_then(|s| s.take_acquire_fence())
    }

    /// Recompute which re-validation checks are pending for this slot.
    pub fn validate_revalidation(&mut self) {
        if self.source_layers.len() == 1 {
            self.revalidation |= RevalidationType::SCANOUT;
        }
    }

    /// Pending re-validation checks
    pub fn revalidation_type(&self) -> RevalidationType {
        self.revalidation
    }

    /// Mark a re-validation check as handled.
    pub fn revalidation_done(&mut self, mask: RevalidationType) {
        self.revalidation -= mask;
    }

    /// Whether this slot may be merged with a neighbour to free a plane
    pub fn can_squash(&self) -> bool {
        !self.cursor_plane && !self.video_plane && !self.apply_effects
    }

    /// The realized kind of this slot, for exhaustive dispatch.
    pub fn role(&self) -> PlaneRole {
        if self.cursor_plane {
            PlaneRole::Cursor
        } else if self.video_plane {
            PlaneRole::Video
        } else if self.needs_offscreen {
            PlaneRole::OffscreenComposed
        } else {
            PlaneRole::Scanout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ResourceManager;
    use crate::layer::HwcLayer;
    use crate::test_utils::{test_layer, TestBufferHandler};
    use std::sync::Arc;

    fn plane(plane_type: PlaneType) -> PlaneRef {
        Arc::new(DisplayPlane::new(
            1,
            plane_type,
            vec![DrmFourcc::Xrgb8888, DrmFourcc::Argb8888],
        ))
    }

    fn overlay_layer(z: usize) -> OverlayLayer {
        let mut resources = ResourceManager::new(Arc::new(TestBufferHandler::default()));
        let mut layer: HwcLayer = test_layer(1, (0, 0), (1920, 1080));
        OverlayLayer::from_hwc_layer(
            &mut layer,
            &mut resources,
            None,
            z,
            z,
            None,
            crate::utils::Transform::empty(),
            false,
        )
    }

    #[test]
    fn scanout_slot_holds_exactly_one_layer() {
        let layer = overlay_layer(0);
        let mut state = DisplayPlaneState::new_scanout(plane(PlaneType::Primary), &layer);
        assert!(state.scanout());
        assert_eq!(state.source_layers(), &[0]);

        let second = overlay_layer(1);
        state.add_layer(&second);
        // More than one source layer forces the composition path.
        assert!(state.needs_offscreen_composition());
        assert_eq!(state.source_layers(), &[0, 1]);
    }

    #[test]
    fn copy_state_marks_rendered_target_as_reusable() {
        let layer = overlay_layer(0);
        let state = DisplayPlaneState::new_offscreen(plane(PlaneType::Overlay), &layer);
        let copy = state.copy_state();
        // No surfaces yet, nothing to reuse.
        assert!(!copy.surface_recycled());
    }

    #[test]
    fn reset_layers_drops_indices_at_threshold() {
        let layer = overlay_layer(0);
        let mut state = DisplayPlaneState::new_scanout(plane(PlaneType::Overlay), &layer);
        state.add_layer(&overlay_layer(1));
        state.add_layer(&overlay_layer(2));
        state.reset_layers(1);
        assert_eq!(state.source_layers(), &[0]);
    }

    #[test]
    fn role_dispatch_is_exhaustive_over_kinds() {
        let layer = overlay_layer(0);
        let scan = DisplayPlaneState::new_scanout(plane(PlaneType::Overlay), &layer);
        assert_eq!(scan.role(), PlaneRole::Scanout);
        let off = DisplayPlaneState::new_offscreen(plane(PlaneType::Overlay), &layer);
        assert_eq!(off.role(), PlaneRole::OffscreenComposed);
        let cursor = DisplayPlaneState::new_scanout(plane(PlaneType::Cursor), &layer);
        assert_eq!(cursor.role(), PlaneRole::Cursor);
    }
}
