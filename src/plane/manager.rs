//! Plane assignment and offscreen target management.
//!
//! The manager turns a Z-ordered layer list into a commit-valid plane
//! configuration. Which plane can host which layer is generation-specific
//! hardware knowledge and lives behind [`PlaneHandler`]; the manager owns the
//! assignment strategy, the offscreen target pool and the re-validation of
//! existing plans.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use drm_fourcc::DrmFourcc;
use tracing::{debug, trace, warn};

use crate::buffer::ResourceManager;
use crate::error::PlaneError;
use crate::layer::OverlayLayer;
use crate::plane::{DisplayPlane, DisplayPlaneState, PlaneRef, PlaneType, RevalidationType};
use crate::surface::{NativeSurface, SurfaceHandle};
use crate::utils::{DeviceFd, Transform};

const SURFACE_FORMAT: DrmFourcc = DrmFourcc::Argb8888;

/// Per-generation plane capability knowledge, provided by the kernel adapter.
pub trait PlaneHandler: Send {
    /// Enumerate the scan-out engines of the pipe.
    fn populate_planes(&mut self) -> Result<Vec<DisplayPlane>, PlaneError>;

    /// Whether `plane` can scan `layer` out directly on this hardware.
    fn supports_layer(&self, plane: &DisplayPlane, layer: &OverlayLayer) -> bool;

    /// Whether the driver would accept `proposal` as an atomic commit.
    fn test_commit(&self, proposal: &[DisplayPlaneState]) -> bool;
}

impl std::fmt::Debug for dyn PlaneHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlaneHandler")
    }
}

/// Chooses plane-layer assignments and owns the offscreen target pool.
#[derive(Debug)]
pub struct DisplayPlaneManager {
    gpu_fd: DeviceFd,
    handler: Box<dyn PlaneHandler>,
    resources: Arc<Mutex<ResourceManager>>,
    planes: Vec<PlaneRef>,
    pool: Vec<SurfaceHandle>,
    width: u32,
    height: u32,
    display_transform: Transform,
}

impl DisplayPlaneManager {
    /// Create a manager for one pipe.
    pub fn new(
        gpu_fd: DeviceFd,
        handler: Box<dyn PlaneHandler>,
        resources: Arc<Mutex<ResourceManager>>,
    ) -> Self {
        DisplayPlaneManager {
            gpu_fd,
            handler,
            resources,
            planes: Vec::new(),
            pool: Vec::new(),
            width: 0,
            height: 0,
            display_transform: Transform::empty(),
        }
    }

    /// Query the planes of the pipe and order them primary first, cursor last.
    pub fn initialize(&mut self, width: u32, height: u32) -> Result<(), PlaneError> {
        let mut planes = self.handler.populate_planes()?;
        if !planes.iter().any(|p| p.plane_type() == PlaneType::Primary) {
            return Err(PlaneError::NoPrimaryPlane);
        }
        planes.sort_by_key(|p| match p.plane_type() {
            PlaneType::Primary => 0,
            PlaneType::Overlay => 1,
            PlaneType::Cursor => 2,
        });
        self.planes = planes.into_iter().map(Arc::new).collect();
        self.width = width;
        self.height = height;
        debug!(planes = self.planes.len(), width, height, "plane manager initialized");
        Ok(())
    }

    /// Display output dimensions
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Display output dimensions
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Device fd used for framebuffer realization
    pub fn gpu_fd(&self) -> &DeviceFd {
        &self.gpu_fd
    }

    /// Record the transform the display controller applies at scan-out.
    pub fn set_display_transform(&mut self, transform: Transform) {
        self.display_transform = transform;
    }

    /// Whether any plane of the pipe can scan out `format`.
    pub fn check_plane_format(&self, format: DrmFourcc) -> bool {
        self.planes.iter().any(|p| p.supports_format(format))
    }

    /// Append plane assignments for `layers[add_index..]` to `composition`.
    ///
    /// With `add_index == 0` this builds the full plan from scratch and
    /// retires the offscreen targets of the previous plan. Returns whether a
    /// GPU composition pass is needed. The resulting plan is commit-valid: a
    /// failing driver test collapses everything onto the primary plane.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_layers(
        &mut self,
        layers: &[OverlayLayer],
        add_index: usize,
        force_gpu: bool,
        commit_checked: &mut bool,
        needs_plane_validation: &mut bool,
        composition: &mut Vec<DisplayPlaneState>,
        previous: &[DisplayPlaneState],
        surfaces_not_inuse: &mut Vec<SurfaceHandle>,
    ) -> Result<bool, PlaneError> {
        if add_index == 0 {
            // The old plan's targets are not carried over; let them age out
            // through the recycling queue. Copied states in `composition`
            // share handles with `previous`, and earlier incremental work may
            // already have queued some, so push each handle once.
            for state in previous {
                for surface in state.surfaces() {
                    surface.set_in_use(false);
                    if !surfaces_not_inuse.iter().any(|s| Arc::ptr_eq(s, surface)) {
                        surfaces_not_inuse.push(surface.clone());
                    }
                }
            }
            for mut state in composition.drain(..) {
                for surface in state.take_surfaces() {
                    let shared = surfaces_not_inuse.iter().any(|s| Arc::ptr_eq(s, &surface));
                    if !shared {
                        // Allocated this frame and never committed; free to
                        // reuse immediately.
                        surface.set_age(-1);
                    }
                }
            }
        }

        let used: HashSet<u32> = composition.iter().map(|s| s.plane().id()).collect();
        let mut free: Vec<PlaneRef> = self
            .planes
            .iter()
            .filter(|p| !used.contains(&p.id()))
            .cloned()
            .collect();

        let mut render_cursor = false;
        for layer in &layers[add_index.min(layers.len())..] {
            if force_gpu && !layer.is_cursor() {
                self.composite_layer(layer, composition, &mut free, true)?;
                continue;
            }

            if layer.is_cursor() {
                let cursor_slot = free
                    .iter()
                    .position(|p| p.plane_type() == PlaneType::Cursor)
                    .filter(|idx| self.handler.supports_layer(&free[*idx], layer));
                if let Some(idx) = cursor_slot {
                    let plane = free.remove(idx);
                    if layer.can_scan_out() && self.realize_framebuffer(layer) {
                        composition.push(DisplayPlaneState::new_scanout(plane, layer));
                    } else {
                        let mut state = DisplayPlaneState::new_offscreen(plane, layer);
                        self.set_offscreen_plane_target_inner(&mut state)?;
                        composition.push(state);
                        render_cursor = true;
                    }
                    continue;
                }
            }

            let direct = layer.can_scan_out().then(|| {
                free.iter().position(|p| {
                    p.plane_type() != PlaneType::Cursor && self.handler.supports_layer(p, layer)
                })
            });
            match direct.flatten() {
                Some(idx) if self.realize_framebuffer(layer) => {
                    let plane = free.remove(idx);
                    composition.push(DisplayPlaneState::new_scanout(plane, layer));
                }
                _ => self.composite_layer(layer, composition, &mut free, false)?,
            }
        }

        if !self.handler.test_commit(composition) {
            debug!("driver rejected plane proposal, collapsing to primary");
            self.squash_to_primary(layers, composition, surfaces_not_inuse)?;
            *needs_plane_validation = false;
        }
        *commit_checked = true;

        let render = render_cursor
            || composition
                .iter()
                .any(|s| s.needs_offscreen_composition() && !s.surface_recycled());
        Ok(render)
    }

    /// Adjust an existing plan for changed layer contents.
    ///
    /// Planes flagged for scanout re-validation flip between direct scanout
    /// and offscreen composition as their layer allows; the adjusted plan is
    /// re-tested against the driver and `force_full_validation` is raised if
    /// it no longer passes.
    pub fn revalidate_planes(
        &mut self,
        composition: &mut Vec<DisplayPlaneState>,
        layers: &[OverlayLayer],
        surfaces_not_inuse: &mut Vec<SurfaceHandle>,
        force_full_validation: &mut bool,
        needs_plane_validation: bool,
        re_validate_commit: bool,
    ) -> Result<bool, PlaneError> {
        let mut render = false;
        for state in composition.iter_mut() {
            if !state.revalidation_type().contains(RevalidationType::SCANOUT) {
                continue;
            }
            if state.source_layers().len() == 1 {
                let layer = &layers[state.source_layers()[0]];
                if state.needs_offscreen_composition()
                    && !state.apply_effects()
                    && layer.can_scan_out()
                    && self.handler.supports_layer(state.plane(), layer)
                {
                    // The layer can go back to direct scanout; the targets
                    // age out through the recycling queue.
                    self.mark_surfaces_for_recycling(state, surfaces_not_inuse, false);
                    state.set_scanout(layer);
                } else if state.scanout() && !layer.can_scan_out() {
                    state.set_needs_offscreen_composition();
                    self.set_offscreen_plane_target(state)?;
                    render = true;
                }
            }
            state.revalidation_done(RevalidationType::SCANOUT);
        }

        if (needs_plane_validation || re_validate_commit) && !self.handler.test_commit(composition)
        {
            *force_full_validation = true;
            return Ok(render);
        }

        render = render
            || composition
                .iter()
                .any(|s| s.needs_offscreen_composition() && !s.surface_recycled());
        Ok(render)
    }

    /// Make sure `state` composites offscreen and owns at least one target.
    pub fn set_offscreen_plane_target(
        &mut self,
        state: &mut DisplayPlaneState,
    ) -> Result<(), PlaneError> {
        self.set_offscreen_plane_target_inner(state)
    }

    /// Pick the target the next draw of `state` renders into, growing the
    /// slot towards triple buffering.
    pub fn prepare_draw_target(&mut self, state: &mut DisplayPlaneState) -> Result<(), PlaneError> {
        if state.surfaces().is_empty() {
            return self.set_offscreen_plane_target(state);
        }
        if state.surfaces().len() < 3 {
            let surface = self.acquire_surface()?;
            state.push_surface(surface);
        } else {
            state.rotate_surfaces();
        }
        Ok(())
    }

    /// Transfer the targets of `state` out of the active plan.
    ///
    /// With `immediate` the targets become reusable right away; otherwise
    /// they join `out_queue` and age out over the following frames, since the
    /// display may still be scanning them.
    pub fn mark_surfaces_for_recycling(
        &mut self,
        state: &mut DisplayPlaneState,
        out_queue: &mut Vec<SurfaceHandle>,
        immediate: bool,
    ) {
        let surfaces = state.take_surfaces();
        if surfaces.is_empty() {
            return;
        }
        trace!(count = surfaces.len(), immediate, "recycling plane surfaces");
        if immediate {
            for surface in surfaces {
                surface.set_age(-1);
            }
        } else {
            out_queue.extend(surfaces);
        }
    }

    /// Destroy pooled targets that aged out.
    pub fn release_free_offscreen_targets(&mut self) {
        let before = self.pool.len();
        self.pool.retain(|s| s.in_use() || s.age() >= 0);
        let released = before - self.pool.len();
        if released > 0 {
            trace!(released, "released free offscreen targets");
        }
    }

    /// Destroy the whole target pool.
    pub fn release_all_offscreen_targets(&mut self) {
        self.pool.clear();
    }

    /// Whether any offscreen target is alive.
    pub fn has_surfaces(&self) -> bool {
        !self.pool.is_empty()
    }

    /// Whether the layer's buffer could be realized for scan-out.
    fn realize_framebuffer(&self, layer: &OverlayLayer) -> bool {
        match layer.buffer() {
            Some(buffer) => buffer.ensure_framebuffer(&self.gpu_fd).is_ok(),
            None => false,
        }
    }

    /// Route `layer` through GPU composition.
    ///
    /// The layer joins the topmost composition slot when one sits at the top
    /// of the stack, otherwise a free plane is claimed as a fresh composition
    /// target. Joining a slot lower in the stack would reorder the layer
    /// below intermediate scanout planes. With `force_single` everything
    /// collapses into the bottom-most slot instead.
    fn composite_layer(
        &mut self,
        layer: &OverlayLayer,
        composition: &mut Vec<DisplayPlaneState>,
        free: &mut Vec<PlaneRef>,
        force_single: bool,
    ) -> Result<(), PlaneError> {
        let top = composition.iter().rposition(|s| !s.is_cursor_plane());
        let join_top = match top {
            Some(idx) => {
                force_single
                    || composition[idx].needs_offscreen_composition()
                    || !free.iter().any(|p| p.plane_type() != PlaneType::Cursor)
            }
            None => false,
        };
        if join_top {
            let idx = top.expect("join_top implies a host slot");
            composition[idx].add_layer(layer);
            self.set_offscreen_plane_target_inner(&mut composition[idx])?;
            return Ok(());
        }
        match free.iter().position(|p| p.plane_type() != PlaneType::Cursor) {
            Some(idx) => {
                let plane = free.remove(idx);
                let mut state = DisplayPlaneState::new_offscreen(plane, layer);
                self.set_offscreen_plane_target_inner(&mut state)?;
                composition.push(state);
            }
            None => warn!(layer = layer.z_order(), "no plane left to host layer"),
        }
        Ok(())
    }

    fn set_offscreen_plane_target_inner(
        &mut self,
        state: &mut DisplayPlaneState,
    ) -> Result<(), PlaneError> {
        if !state.needs_offscreen_composition() {
            state.set_needs_offscreen_composition();
        }
        if state.surfaces().is_empty() {
            let surface = self.acquire_surface()?;
            state.push_surface(surface);
        }
        Ok(())
    }

    fn squash_to_primary(
        &mut self,
        layers: &[OverlayLayer],
        composition: &mut Vec<DisplayPlaneState>,
        surfaces_not_inuse: &mut Vec<SurfaceHandle>,
    ) -> Result<(), PlaneError> {
        let mut merged: Option<DisplayPlaneState> = None;
        let mut cursor: Option<DisplayPlaneState> = None;
        for mut state in composition.drain(..) {
            if state.is_cursor_plane() {
                cursor = Some(state);
                continue;
            }
            match merged.as_mut() {
                None => merged = Some(state),
                Some(bottom) => {
                    self.mark_surfaces_for_recycling(&mut state, surfaces_not_inuse, false);
                    for idx in state.source_layers().to_vec() {
                        bottom.add_layer(&layers[idx]);
                    }
                }
            }
        }
        if let Some(mut bottom) = merged {
            bottom.set_needs_offscreen_composition();
            self.set_offscreen_plane_target_inner(&mut bottom)?;
            composition.push(bottom);
        }
        if let Some(cursor) = cursor {
            composition.push(cursor);
        }
        if !self.handler.test_commit(composition) {
            warn!("driver rejected even the collapsed plane configuration");
        }
        Ok(())
    }

    fn acquire_surface(&mut self) -> Result<SurfaceHandle, PlaneError> {
        if let Some(surface) = self
            .pool
            .iter()
            .find(|s| !s.in_use() && s.age() < 0 && s.width() == self.width && s.height() == self.height)
            .cloned()
        {
            surface.mark_full_clear();
            return Ok(surface);
        }
        let buffer = self
            .resources
            .lock()
            .unwrap()
            .allocate_surface_buffer(self.width, self.height, SURFACE_FORMAT)?;
        let surface: SurfaceHandle = Arc::new(NativeSurface::new(buffer));
        self.pool.push(surface.clone());
        Ok(surface)
    }
}
