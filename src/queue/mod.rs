//! The per-display frame pipeline.
//!
//! [`DisplayQueue`] takes the caller's Z-ordered layer list once per refresh,
//! diffs it against the previous frame, decides between patching the cached
//! plane assignment and re-validating from scratch, runs the GPU composition
//! pass for planes that need one and drives the result into the kernel
//! adapter as one atomic commit. Fences flow back out: the commit's out-fence
//! is duplicated into per-layer release fences and retained until the next
//! frame's buffers may be touched.
//!
//! The caller thread owns the queue. Vsync-driven side channels
//! ([`QueueHandle::handle_idle_case`], [`QueueHandle::force_refresh`]) and
//! video tuning run against shared interior state and may be used from other
//! threads.

use std::sync::{Arc, Mutex};

use tracing::{debug, info_span, trace, warn};

use crate::buffer::{NativeBufferHandler, ResourceManager};
use crate::compositor::{
    Compositor, DeinterlaceControl, DeinterlaceFlag, RenderBackend, VideoColorControl,
    VideoColorValue,
};
use crate::display::{
    ColorMatrix, ColorTransformHint, GammaCurve, PhysicalDisplay, PowerMode, RotationMode,
};
use crate::error::{FrameError, InitError, PlaneError};
use crate::layer::{CompositionKind, HwcLayer, OverlayLayer};
use crate::plane::{DisplayPlaneManager, DisplayPlaneState, PlaneHandler, RevalidationType};
use crate::surface::{ClearKind, SurfaceHandle};
use crate::sync::SyncFence;
use crate::utils::{DeviceFd, Rectangle, Transform};
use crate::vblank::{VblankEventHandler, VsyncCallback};

/// Consecutive idle vblanks before the refresh callback requests an idle
/// composition.
pub const IDLE_FRAMES: u32 = 9;

/// Incremental GPU-composited frames before plane assignment is re-validated
/// to try moving layers back onto overlays.
const REVALIDATION_DELAY: u32 = 3;

bitflags::bitflags! {
    /// Queue-level state word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueState: u32 {
        /// The display is powered on
        const POWERED_ON = 1 << 0;
        /// Mode or scaling changed, the next frame must re-validate
        const CONFIGURATION_CHANGED = 1 << 1;
        /// Color correction values must be pushed with the next commit
        const NEEDS_COLOR_CORRECTION = 1 << 2;
        /// Never assign layers to overlay planes
        const DISABLE_OVERLAY_USAGE = 1 << 3;
        /// Suppress refresh callbacks (power transitions, teardown)
        const IGNORE_IDLE_REFRESH = 1 << 4;
        /// This display mirrors another one
        const CLONED_MODE = 1 << 5;
        /// The last committed frame was an idle composition
        const LAST_FRAME_IDLE_UPDATE = 1 << 6;
        /// Free offscreen targets after the next stable frame
        const MARK_SURFACES_FOR_RELEASE = 1 << 7;
        /// Free offscreen targets now, unless a validation intervened
        const RELEASE_SURFACES = 1 << 8;
    }
}

bitflags::bitflags! {
    /// State word of the idle-frame tracker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameState: u32 {
        /// Drop incoming updates without touching queue state
        const IGNORE_UPDATES = 1 << 0;
        /// Counting towards a plane re-validation, idle detection paused
        const TRACKING_FRAMES = 1 << 1;
        /// Force full validation on the next update
        const REVALIDATE_LAYERS = 1 << 2;
        /// An update is currently inside the queue
        const PREPARE_COMPOSITION = 1 << 3;
        /// The refresh callback fired, the next update renders the idle frame
        const PREPARE_IDLE_COMPOSITION = 1 << 4;
        /// A cloned display already rendered its idle frame
        const RENDER_IDLE_DISPLAY = 1 << 5;
    }
}

/// Refresh callback: the compositor should resubmit the current layer stack.
pub type RefreshCallback = Box<dyn FnMut(u32) + Send>;

#[derive(Debug, Default)]
struct FrameStateTracker {
    state: FrameState,
    idle_frames: u32,
    has_cursor_layer: bool,
    total_planes: usize,
    revalidate_frames_counter: u32,
}

struct RefreshSlot(RefreshCallback);

impl std::fmt::Debug for RefreshSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RefreshCallback")
    }
}

#[derive(Debug, Default)]
struct IdleState {
    tracker: FrameStateTracker,
    refresh_callback: Option<RefreshSlot>,
    refresh_display_id: u32,
}

#[derive(Debug, Default)]
struct VideoState {
    requested_video_effect: bool,
}

#[derive(Debug)]
struct QueueShared {
    // Doubles as the power-mode lock: guards the state word, compositor
    // initialization and refresh-callback invocation.
    state: Mutex<QueueState>,
    idle: Mutex<IdleState>,
    video: Mutex<VideoState>,
    compositor: Mutex<Compositor>,
}

/// Cloneable handle onto the queue's shared state, for the vsync dispatcher
/// and video tuning threads.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
}

impl QueueHandle {
    /// Vblank-side idle detection.
    ///
    /// Counts consecutive idle vblanks; once the counter passes
    /// [`IDLE_FRAMES`] the refresh callback fires exactly once and the next
    /// update renders the idle composition. No-op while an update is in
    /// flight, while fewer than two planes are active, while frames are being
    /// tracked for re-validation or while a cursor is on screen.
    pub fn handle_idle_case(&self) {
        let mut guard = self.shared.idle.lock().unwrap();
        let idle: &mut IdleState = &mut guard;
        if idle.tracker.state.contains(FrameState::PREPARE_COMPOSITION) {
            return;
        }
        if idle.tracker.total_planes <= 1
            || idle
                .tracker
                .state
                .intersects(FrameState::TRACKING_FRAMES | FrameState::REVALIDATE_LAYERS)
            || idle.tracker.has_cursor_layer
        {
            return;
        }
        if idle.tracker.idle_frames > IDLE_FRAMES {
            return;
        }
        if idle.tracker.idle_frames < IDLE_FRAMES {
            idle.tracker.idle_frames += 1;
            return;
        }
        idle.tracker.idle_frames += 1;

        let state = self.shared.state.lock().unwrap();
        if !state.contains(QueueState::IGNORE_IDLE_REFRESH) && state.contains(QueueState::POWERED_ON)
        {
            let display_id = idle.refresh_display_id;
            if let Some(RefreshSlot(callback)) = idle.refresh_callback.as_mut() {
                trace!(display_id, "idle threshold passed, requesting refresh");
                callback(display_id);
                idle.tracker.state |= FrameState::PREPARE_IDLE_COMPOSITION;
            }
        }
    }

    /// Leave ignore-updates mode and force the next update through full
    /// validation, asking the compositor for a refresh right away.
    pub fn force_refresh(&self) {
        let mut guard = self.shared.idle.lock().unwrap();
        let idle: &mut IdleState = &mut guard;
        idle.tracker.state -= FrameState::IGNORE_UPDATES | FrameState::RENDER_IDLE_DISPLAY;
        idle.tracker.state |= FrameState::REVALIDATE_LAYERS;

        let state = self.shared.state.lock().unwrap();
        if !state.contains(QueueState::IGNORE_IDLE_REFRESH) && state.contains(QueueState::POWERED_ON)
        {
            let display_id = idle.refresh_display_id;
            if let Some(RefreshSlot(callback)) = idle.refresh_callback.as_mut() {
                callback(display_id);
            }
        }
    }

    /// Register the refresh consumer.
    pub fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        let mut idle = self.shared.idle.lock().unwrap();
        idle.refresh_callback = Some(RefreshSlot(callback));
        idle.refresh_display_id = display_id;
    }

    /// Set a video color channel; the next frame with video content runs a
    /// full media composition.
    pub fn set_video_color(&self, control: VideoColorControl, value: f32) {
        let mut video = self.shared.video.lock().unwrap();
        video.requested_video_effect = true;
        self.shared
            .compositor
            .lock()
            .unwrap()
            .set_video_color(control, value);
    }

    /// Read back a video color channel and its accepted range.
    pub fn video_color(&self, control: VideoColorControl) -> VideoColorValue {
        self.shared.compositor.lock().unwrap().video_color(control)
    }

    /// Restore one video color channel to its default.
    pub fn restore_video_default_color(&self, control: VideoColorControl) {
        let mut video = self.shared.video.lock().unwrap();
        video.requested_video_effect = false;
        self.shared
            .compositor
            .lock()
            .unwrap()
            .restore_video_default_color(control);
    }

    /// Configure video deinterlacing.
    pub fn set_video_deinterlace(&self, flag: DeinterlaceFlag, mode: DeinterlaceControl) {
        let mut video = self.shared.video.lock().unwrap();
        video.requested_video_effect = true;
        self.shared
            .compositor
            .lock()
            .unwrap()
            .set_video_deinterlace(flag, mode);
    }

    /// Restore default deinterlacing.
    pub fn restore_video_default_deinterlace(&self) {
        let mut video = self.shared.video.lock().unwrap();
        video.requested_video_effect = false;
        self.shared
            .compositor
            .lock()
            .unwrap()
            .restore_video_default_deinterlace();
    }

    /// Select the video scaling filter. Does not request media
    /// re-composition on its own.
    pub fn set_video_scaling_mode(&self, mode: u32) {
        let _video = self.shared.video.lock().unwrap();
        self.shared
            .compositor
            .lock()
            .unwrap()
            .set_video_scaling_mode(mode);
    }
}

/// Display-to-primary scaling state for cloned pipelines.
#[derive(Debug, Default)]
struct ScalingTracker {
    needs_scaling: bool,
    scaling_width: f32,
    scaling_height: f32,
}

impl ScalingTracker {
    fn scaled_frame(&self, frame: Rectangle<i32>) -> Option<Rectangle<i32>> {
        if !self.needs_scaling {
            return None;
        }
        let br = frame.bottom_right();
        let left = frame.loc.x as f32 + frame.loc.x as f32 * self.scaling_width;
        let top = frame.loc.y as f32 + frame.loc.y as f32 * self.scaling_height;
        let right = br.x as f32 + br.x as f32 * self.scaling_width;
        let bottom = br.y as f32 + br.y as f32 * self.scaling_height;
        Some(Rectangle::from_extremities(
            (left as i32, top as i32),
            (right as i32, bottom as i32),
        ))
    }
}

struct FrameOutcome {
    total_planes: usize,
    idle_frame: bool,
    used_gpu: bool,
}

/// Frame-scoped view of the idle tracker.
///
/// Construction snapshots the tracker decisions for the frame; dropping it
/// publishes the frame outcome, on every exit path of `queue_update`.
struct ScopedStateTracker {
    shared: Arc<QueueShared>,
    ignore: bool,
    render_idle: bool,
    revalidate: bool,
    has_cursor: bool,
    outcome: Option<FrameOutcome>,
}

impl ScopedStateTracker {
    fn new(shared: &Arc<QueueShared>) -> Self {
        let mut idle = shared.idle.lock().unwrap();
        let state = idle.tracker.state;
        idle.tracker.state |= FrameState::PREPARE_COMPOSITION;
        ScopedStateTracker {
            shared: shared.clone(),
            ignore: state
                .intersects(FrameState::IGNORE_UPDATES | FrameState::RENDER_IDLE_DISPLAY),
            render_idle: state.contains(FrameState::PREPARE_IDLE_COMPOSITION),
            revalidate: state.contains(FrameState::REVALIDATE_LAYERS),
            has_cursor: false,
            outcome: None,
        }
    }

    fn ignore_update(&self) -> bool {
        self.ignore
    }

    fn render_idle_mode(&self) -> bool {
        self.render_idle
    }

    fn revalidate_layers(&self) -> bool {
        self.revalidate
    }

    fn frame_has_cursor(&mut self) {
        self.has_cursor = true;
    }

    fn reset_tracker_state(&mut self) {
        let mut idle = self.shared.idle.lock().unwrap();
        idle.tracker.state -= FrameState::REVALIDATE_LAYERS | FrameState::TRACKING_FRAMES;
        idle.tracker.revalidate_frames_counter = 0;
    }

    fn complete(&mut self, total_planes: usize, idle_frame: bool, used_gpu: bool) {
        self.outcome = Some(FrameOutcome {
            total_planes,
            idle_frame,
            used_gpu,
        });
    }
}

impl Drop for ScopedStateTracker {
    fn drop(&mut self) {
        let mut idle = self.shared.idle.lock().unwrap();
        idle.tracker.state -= FrameState::PREPARE_COMPOSITION;
        if self.ignore {
            return;
        }
        idle.tracker.has_cursor_layer = self.has_cursor;
        let outcome = match &self.outcome {
            Some(outcome) => outcome,
            // The frame failed or was suppressed; leave idle accounting as-is.
            None => return,
        };
        idle.tracker.total_planes = outcome.total_planes;
        idle.tracker.state -= FrameState::PREPARE_IDLE_COMPOSITION;
        if outcome.idle_frame {
            return;
        }
        idle.tracker.idle_frames = 0;
        if outcome.used_gpu {
            idle.tracker.state |= FrameState::TRACKING_FRAMES;
            idle.tracker.revalidate_frames_counter += 1;
            if idle.tracker.revalidate_frames_counter > REVALIDATION_DELAY {
                idle.tracker.state |= FrameState::REVALIDATE_LAYERS;
                idle.tracker.state -= FrameState::TRACKING_FRAMES;
                idle.tracker.revalidate_frames_counter = 0;
            }
        } else {
            idle.tracker.state -= FrameState::TRACKING_FRAMES;
            idle.tracker.revalidate_frames_counter = 0;
        }
    }
}

#[derive(Debug, Default)]
struct CachedLayers {
    render_layers: bool,
    can_ignore_commit: bool,
    needs_plane_validation: bool,
    force_full_validation: bool,
    only_cursor_rect_changed: bool,
}

impl CachedLayers {
    fn force_full() -> Self {
        CachedLayers {
            force_full_validation: true,
            ..Default::default()
        }
    }
}

/// The per-display composition pipeline.
#[derive(Debug)]
pub struct DisplayQueue {
    gpu_fd: DeviceFd,
    display: Box<dyn PhysicalDisplay>,
    resources: Arc<Mutex<ResourceManager>>,
    plane_manager: Option<DisplayPlaneManager>,
    vblank: VblankEventHandler,
    shared: Arc<QueueShared>,

    in_flight_layers: Vec<OverlayLayer>,
    previous_plane_state: Vec<DisplayPlaneState>,
    surfaces_not_inuse: Vec<SurfaceHandle>,
    mark_not_inuse: Vec<SurfaceHandle>,
    kms_fence: Option<SyncFence>,
    last_commit_failed_update: bool,
    applied_video_effect: bool,
    handle_display_initializations: bool,

    plane_transform: Transform,
    scaling_tracker: ScalingTracker,

    gamma: GammaCurve,
    contrast: u32,
    brightness: u32,
    color_transform_matrix: ColorMatrix,
    color_transform_hint: ColorTransformHint,
}

impl DisplayQueue {
    /// Create the queue for one display.
    pub fn new(
        gpu_fd: DeviceFd,
        disable_overlay: bool,
        buffer_handler: Arc<dyn NativeBufferHandler>,
        display: Box<dyn PhysicalDisplay>,
        render_backend: Box<dyn RenderBackend>,
    ) -> Self {
        let mut state = QueueState::NEEDS_COLOR_CORRECTION;
        if disable_overlay {
            state |= QueueState::DISABLE_OVERLAY_USAGE;
        }
        DisplayQueue {
            gpu_fd,
            display,
            resources: Arc::new(Mutex::new(ResourceManager::new(buffer_handler))),
            plane_manager: None,
            vblank: VblankEventHandler::new(),
            shared: Arc::new(QueueShared {
                state: Mutex::new(state),
                idle: Mutex::new(IdleState::default()),
                video: Mutex::new(VideoState::default()),
                compositor: Mutex::new(Compositor::new(render_backend)),
            }),
            in_flight_layers: Vec::new(),
            previous_plane_state: Vec::new(),
            surfaces_not_inuse: Vec::new(),
            mark_not_inuse: Vec::new(),
            kms_fence: None,
            last_commit_failed_update: false,
            applied_video_effect: false,
            handle_display_initializations: false,
            plane_transform: Transform::empty(),
            scaling_tracker: ScalingTracker::default(),
            gamma: GammaCurve::default(),
            // 0x80 per channel is the neutral point of the hardware LUTs.
            contrast: 0x80_80_80,
            brightness: 0x80_80_80,
            color_transform_matrix: [0.0; 16],
            color_transform_hint: ColorTransformHint::Identical,
        }
    }

    /// Build the plane manager for `pipe` and arm the vblank handler in the
    /// powered-off state.
    pub fn initialize(
        &mut self,
        pipe: u32,
        width: u32,
        height: u32,
        plane_handler: Box<dyn PlaneHandler>,
    ) -> Result<(), InitError> {
        let mut manager =
            DisplayPlaneManager::new(self.gpu_fd.clone(), plane_handler, self.resources.clone());
        manager.initialize(width, height)?;
        manager.set_display_transform(self.plane_transform);
        self.plane_manager = Some(manager);
        self.reset_queue();
        self.vblank.set_power_mode(PowerMode::Off);
        self.vblank.init(self.gpu_fd.clone(), pipe);
        self.handle_display_initializations = true;
        Ok(())
    }

    /// Handle onto the shared state for other threads.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: self.shared.clone(),
        }
    }

    /// The vblank handler, for the embedder's vsync dispatcher thread.
    pub fn vblank_handler(&self) -> VblankEventHandler {
        self.vblank.clone()
    }

    /// Change the display power mode. Unknown transitions are ignored.
    pub fn set_power_mode(&mut self, mode: PowerMode) {
        match mode {
            PowerMode::Off | PowerMode::Doze => self.handle_exit(),
            PowerMode::DozeSuspend => {
                self.vblank.set_power_mode(PowerMode::DozeSuspend);
                self.shared.state.lock().unwrap().insert(QueueState::POWERED_ON);
            }
            PowerMode::On => {
                self.shared.state.lock().unwrap().insert(
                    QueueState::POWERED_ON
                        | QueueState::CONFIGURATION_CHANGED
                        | QueueState::NEEDS_COLOR_CORRECTION,
                );
                self.vblank.set_power_mode(PowerMode::On);
                let mut state = self.shared.state.lock().unwrap();
                state.remove(QueueState::IGNORE_IDLE_REFRESH);
                if let Some(manager) = &self.plane_manager {
                    let mut compositor = self.shared.compositor.lock().unwrap();
                    if let Err(err) = compositor.init(manager.gpu_fd()) {
                        warn!("compositor initialization failed: {err}");
                    }
                }
            }
        }
    }

    /// Accumulate a display rotation. Propagated to the plane manager;
    /// unknown rotation values are ignored.
    pub fn rotate_display(&mut self, rotation: RotationMode) {
        match rotation {
            RotationMode::Rotate90 => self.plane_transform |= Transform::ROT_90,
            RotationMode::Rotate180 => self.plane_transform |= Transform::ROT_180,
            RotationMode::Rotate270 => self.plane_transform |= Transform::ROT_270,
            RotationMode::None => {}
        }
        if let Some(manager) = &mut self.plane_manager {
            manager.set_display_transform(self.plane_transform);
        }
    }

    /// Enter or leave cloned mode. A cloned display stops delivering vsync
    /// and retire fences; leaving forces re-validation.
    pub fn set_clone_mode(&mut self, cloned: bool) {
        let mut state = self.shared.state.lock().unwrap();
        if cloned {
            if !state.contains(QueueState::CLONED_MODE) {
                state.insert(QueueState::CLONED_MODE);
                drop(state);
                self.vblank.set_power_mode(PowerMode::Off);
            }
        } else if state.contains(QueueState::CLONED_MODE) {
            state.remove(QueueState::CLONED_MODE);
            state.insert(QueueState::CONFIGURATION_CHANGED);
            drop(state);
            self.vblank.set_power_mode(PowerMode::On);
        }
    }

    /// Drop all incoming updates until [`QueueHandle::force_refresh`].
    pub fn ignore_updates(&mut self) {
        let mut idle = self.shared.idle.lock().unwrap();
        idle.tracker.idle_frames = 0;
        idle.tracker.state = FrameState::IGNORE_UPDATES;
        idle.tracker.revalidate_frames_counter = 0;
    }

    /// See [`QueueHandle::force_refresh`].
    pub fn force_refresh(&self) {
        self.handle().force_refresh();
    }

    /// See [`QueueHandle::handle_idle_case`].
    pub fn handle_idle_case(&self) {
        self.handle().handle_idle_case();
    }

    /// Mark the display configuration dirty; the next update re-validates
    /// and commits a modeset.
    pub fn display_configuration_changed(&mut self) {
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(QueueState::CONFIGURATION_CHANGED);
    }

    /// Record the scaling ratio between this display and the primary one.
    pub fn update_scaling_ratio(
        &mut self,
        primary_width: u32,
        primary_height: u32,
        display_width: u32,
        display_height: u32,
    ) {
        self.scaling_tracker.needs_scaling = false;
        let primary_area = primary_width * primary_height;
        let display_area = display_width * display_height;
        if primary_area != display_area {
            self.scaling_tracker.needs_scaling = true;
            self.scaling_tracker.scaling_width =
                (display_width as f32 - primary_width as f32) / primary_width as f32;
            self.scaling_tracker.scaling_height =
                (display_height as f32 - primary_height as f32) / primary_height as f32;
        }
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(QueueState::CONFIGURATION_CHANGED);
    }

    /// Register the vsync consumer.
    pub fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) {
        self.vblank.register_callback(callback, display_id);
    }

    /// See [`QueueHandle::register_refresh_callback`].
    pub fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        self.handle().register_refresh_callback(callback, display_id);
    }

    /// Enable or disable vsync delivery.
    pub fn vsync_control(&self, enabled: bool) {
        self.vblank.vsync_control(enabled);
    }

    /// Disable or re-enable overlay plane usage wholesale.
    pub fn set_explicit_sync_support(&mut self, disable_explicit_sync: bool) {
        let mut state = self.shared.state.lock().unwrap();
        if disable_explicit_sync {
            state.insert(QueueState::DISABLE_OVERLAY_USAGE);
        } else {
            state.remove(QueueState::DISABLE_OVERLAY_USAGE);
        }
    }

    /// Whether any plane of the pipe scans out `format`.
    pub fn check_plane_format(&self, format: drm_fourcc::DrmFourcc) -> bool {
        self.plane_manager
            .as_ref()
            .map(|m| m.check_plane_format(format))
            .unwrap_or(false)
    }

    /// Set per-channel gamma. Takes effect with the next commit.
    pub fn set_gamma(&mut self, red: f32, green: f32, blue: f32) {
        self.gamma = GammaCurve { red, green, blue };
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(QueueState::NEEDS_COLOR_CORRECTION);
    }

    /// Set per-channel contrast; channels are masked to 8 bits.
    pub fn set_contrast(&mut self, red: u32, green: u32, blue: u32) {
        self.contrast = ((red & 0xFF) << 16) | ((green & 0xFF) << 8) | (blue & 0xFF);
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(QueueState::NEEDS_COLOR_CORRECTION);
    }

    /// Set per-channel brightness; channels are masked to 8 bits.
    pub fn set_brightness(&mut self, red: u32, green: u32, blue: u32) {
        self.brightness = ((red & 0xFF) << 16) | ((green & 0xFF) << 8) | (blue & 0xFF);
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(QueueState::NEEDS_COLOR_CORRECTION);
    }

    /// Set the color transform matrix.
    pub fn set_color_transform(&mut self, matrix: &ColorMatrix, hint: ColorTransformHint) {
        self.color_transform_hint = hint;
        if hint == ColorTransformHint::ArbitraryMatrix {
            self.color_transform_matrix = *matrix;
        }
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(QueueState::NEEDS_COLOR_CORRECTION);
    }

    /// See [`QueueHandle::set_video_color`].
    pub fn set_video_color(&self, control: VideoColorControl, value: f32) {
        self.handle().set_video_color(control, value);
    }

    /// See [`QueueHandle::video_color`].
    pub fn video_color(&self, control: VideoColorControl) -> VideoColorValue {
        self.handle().video_color(control)
    }

    /// See [`QueueHandle::restore_video_default_color`].
    pub fn restore_video_default_color(&self, control: VideoColorControl) {
        self.handle().restore_video_default_color(control);
    }

    /// See [`QueueHandle::set_video_deinterlace`].
    pub fn set_video_deinterlace(&self, flag: DeinterlaceFlag, mode: DeinterlaceControl) {
        self.handle().set_video_deinterlace(flag, mode);
    }

    /// See [`QueueHandle::restore_video_default_deinterlace`].
    pub fn restore_video_default_deinterlace(&self) {
        self.handle().restore_video_default_deinterlace();
    }

    /// See [`QueueHandle::set_video_scaling_mode`].
    pub fn set_video_scaling_mode(&self, mode: u32) {
        self.handle().set_video_scaling_mode(mode);
    }

    /// Tear the pipe down: disable planes, drop the pending kms fence and
    /// reset all frame state. Only overlay-usage, cloned-mode and
    /// configuration-changed survive. Idempotent.
    pub fn handle_exit(&mut self) {
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(QueueState::IGNORE_IDLE_REFRESH);
        self.vblank.set_power_mode(PowerMode::Off);
        if !self.previous_plane_state.is_empty() {
            self.display.disable(&self.previous_plane_state);
        }
        // Closed without waiting; the pipe is going down anyway.
        self.kms_fence = None;

        let mut state = self.shared.state.lock().unwrap();
        let preserved = *state & (QueueState::DISABLE_OVERLAY_USAGE | QueueState::CLONED_MODE);
        *state = QueueState::CONFIGURATION_CHANGED | preserved;
        drop(state);

        self.reset_queue();
    }

    fn reset_queue(&mut self) {
        self.applied_video_effect = false;
        self.last_commit_failed_update = false;
        self.in_flight_layers.clear();
        self.previous_plane_state.clear();
        self.mark_not_inuse.clear();
        self.surfaces_not_inuse.clear();
        if let Some(manager) = &mut self.plane_manager {
            if manager.has_surfaces() {
                manager.release_all_offscreen_targets();
            }
        }
        self.resources.lock().unwrap().purge();

        let mut idle = self.shared.idle.lock().unwrap();
        let ignore_updates = idle.tracker.state.contains(FrameState::IGNORE_UPDATES);
        idle.tracker = FrameStateTracker::default();
        if ignore_updates {
            idle.tracker.state |= FrameState::IGNORE_UPDATES;
        }
        drop(idle);

        self.shared.compositor.lock().unwrap().reset();
    }

    /// The core per-frame operation.
    ///
    /// Returns the retire fence of the committed frame, `None` when the
    /// update was ignored, suppressed as unchanged, or the display is cloned.
    /// Release fences are stored into the submitted layers. On failure the
    /// previous frame's state stays published and the next update runs a
    /// full validation.
    pub fn queue_update(
        &mut self,
        source_layers: &mut [HwcLayer],
        idle_update: bool,
        handle_constraints: bool,
    ) -> Result<Option<SyncFence>, FrameError> {
        let span = info_span!("queue_update", layers = source_layers.len(), idle_update);
        let _enter = span.enter();

        if self.plane_manager.is_none() {
            return Err(FrameError::NotInitialized);
        }
        let mut tracker = ScopedStateTracker::new(&self.shared);
        if tracker.ignore_update() {
            return Ok(None);
        }

        let DisplayQueue {
            display,
            resources,
            plane_manager,
            shared,
            in_flight_layers,
            previous_plane_state,
            surfaces_not_inuse,
            mark_not_inuse,
            kms_fence,
            last_commit_failed_update,
            applied_video_effect,
            handle_display_initializations,
            plane_transform,
            scaling_tracker,
            gamma,
            contrast,
            brightness,
            color_transform_matrix,
            color_transform_hint,
            ..
        } = self;
        let manager = plane_manager.as_mut().ok_or(FrameError::NotInitialized)?;

        let previous_size = in_flight_layers.len();
        let mut layers: Vec<OverlayLayer> = Vec::with_capacity(source_layers.len());
        let mut add_index: Option<usize> = None;
        let mut remove_index: Option<usize> = None;
        let mut idle_frame = tracker.render_idle_mode() || idle_update;
        let mut validate_layers = *last_commit_failed_update || previous_plane_state.is_empty();
        let mut has_video_layer = false;
        let mut re_validate_commit = false;
        let mut handle_raw_pixel_update = false;
        let mut z_order = 0usize;

        {
            let mut resources = resources.lock().unwrap();
            for (layer_index, layer) in source_layers.iter_mut().enumerate() {
                layer.set_release_fence(None);
                if !layer.is_visible() {
                    continue;
                }
                let previous = in_flight_layers.get(z_order);
                if previous.is_none() && add_index.is_none() {
                    add_index = Some(z_order);
                }
                let frame_override = scaling_tracker.scaled_frame(layer.display_frame());
                let overlay = OverlayLayer::from_hwc_layer(
                    layer,
                    &mut resources,
                    previous,
                    z_order,
                    layer_index,
                    frame_override,
                    *plane_transform,
                    handle_constraints,
                );
                if !overlay.is_visible() {
                    continue;
                }

                if overlay.raw_pixel_data_changed() {
                    handle_raw_pixel_update = true;
                }
                if overlay.is_video() {
                    has_video_layer = true;
                }
                if overlay.needs_revalidation() {
                    re_validate_commit = true;
                } else if overlay.has_content_changed() {
                    idle_frame = false;
                }
                if overlay.is_cursor() {
                    tracker.frame_has_cursor();
                }

                let skip_diff = add_index == Some(0)
                    || validate_layers
                    || (add_index.is_some() && remove_index.is_some());
                if !skip_diff {
                    if let Some(prev) = previous {
                        // A cursor or video layer appearing, disappearing or
                        // changing Z invalidates the cached assignment from
                        // the flip position upward.
                        if prev.is_cursor() != overlay.is_cursor()
                            || prev.is_video() != overlay.is_video()
                        {
                            if remove_index.is_none() {
                                remove_index = Some(prev.z_order());
                            }
                            if add_index.is_none() {
                                add_index = Some(overlay.z_order());
                            }
                        }
                    }
                }

                layers.push(overlay);
                z_order += 1;
            }
        }

        if handle_raw_pixel_update {
            if let Err(err) = shared
                .compositor
                .lock()
                .unwrap()
                .update_layer_pixel_data(&layers)
            {
                *last_commit_failed_update = true;
                return Err(FrameError::Draw(err));
            }
        }

        let size = layers.len();
        if add_index == Some(0) || validate_layers {
            validate_layers = true;
        } else if previous_size > size {
            match (remove_index, add_index) {
                (None, _) => remove_index = Some(size),
                (Some(remove), Some(add)) => remove_index = Some(remove.min(add)),
                _ => {}
            }
        }

        if idle_frame && (add_index.is_some() || remove_index.is_some() || re_validate_commit) {
            idle_frame = false;
        }
        if !validate_layers {
            validate_layers = idle_frame;
        }

        let mut force_media_composition = false;
        let mut requested_video_effect = false;
        if has_video_layer {
            let video = shared.video.lock().unwrap();
            if video.requested_video_effect != *applied_video_effect {
                force_media_composition = true;
                *applied_video_effect = video.requested_video_effect;
                requested_video_effect = video.requested_video_effect;
                idle_frame = false;
                validate_layers = true;
            }
        }

        let disable_overlays = shared
            .state
            .lock()
            .unwrap()
            .contains(QueueState::DISABLE_OVERLAY_USAGE);
        if !validate_layers && tracker.revalidate_layers() {
            validate_layers = true;
        }

        let mut current_composition_planes: Vec<DisplayPlaneState> = Vec::new();
        let mut render_layers = false;

        if !validate_layers {
            let cached = get_cached_layers(
                manager,
                previous_plane_state,
                &layers,
                remove_index,
                &mut current_composition_planes,
                surfaces_not_inuse,
            )?;
            trace!(
                render = cached.render_layers,
                ignore = cached.can_ignore_commit,
                cursor_only = cached.only_cursor_rect_changed,
                "patched cached plane state"
            );
            render_layers = cached.render_layers;
            let mut can_ignore_commit = cached.can_ignore_commit;
            let mut needs_plane_validation = cached.needs_plane_validation;
            validate_layers = cached.force_full_validation;
            let mut commit_checked = false;

            if !validate_layers {
                if let Some(add) = add_index.filter(|&add| add > 0) {
                    let render_cursor = manager.validate_layers(
                        &layers,
                        add,
                        disable_overlays,
                        &mut commit_checked,
                        &mut needs_plane_validation,
                        &mut current_composition_planes,
                        previous_plane_state,
                        surfaces_not_inuse,
                    )?;
                    render_layers |= render_cursor;
                    can_ignore_commit = false;
                    if commit_checked {
                        re_validate_commit = false;
                    }
                }
            }

            if !validate_layers && (re_validate_commit || needs_plane_validation) {
                let render = manager.revalidate_planes(
                    &mut current_composition_planes,
                    &layers,
                    surfaces_not_inuse,
                    &mut validate_layers,
                    needs_plane_validation,
                    re_validate_commit,
                )?;
                can_ignore_commit = false;
                render_layers |= render;
            }

            if !validate_layers {
                if force_media_composition {
                    set_media_effects_state(
                        manager,
                        requested_video_effect,
                        &layers,
                        &mut current_composition_planes,
                        surfaces_not_inuse,
                    )?;
                    render_layers = true;
                    can_ignore_commit = false;
                }

                if can_ignore_commit {
                    // Nothing on screen changes; keep presenting the last
                    // committed frame.
                    std::mem::swap(in_flight_layers, &mut layers);
                    tracker.complete(previous_plane_state.len(), false, false);
                    return Ok(None);
                }
            }
        }

        *last_commit_failed_update = false;

        if validate_layers {
            if !idle_frame {
                tracker.reset_tracker_state();
            }
            let configuration_changed = shared
                .state
                .lock()
                .unwrap()
                .contains(QueueState::CONFIGURATION_CHANGED);
            let force_gpu =
                disable_overlays || idle_frame || (configuration_changed && layers.len() > 1);
            let mut test_commit_a = false;
            let mut test_commit_b = false;
            render_layers = manager.validate_layers(
                &layers,
                0,
                force_gpu,
                &mut test_commit_a,
                &mut test_commit_b,
                &mut current_composition_planes,
                previous_plane_state,
                surfaces_not_inuse,
            )?;
            if force_media_composition && requested_video_effect {
                set_media_effects_state(
                    manager,
                    requested_video_effect,
                    &layers,
                    &mut current_composition_planes,
                    surfaces_not_inuse,
                )?;
                render_layers = true;
            }
            shared
                .state
                .lock()
                .unwrap()
                .remove(QueueState::CONFIGURATION_CHANGED);
            debug!(
                planes = current_composition_planes.len(),
                force_gpu, render_layers, "full validation"
            );
        }

        if render_layers {
            let mut compositor = shared.compositor.lock().unwrap();
            if let Err(err) = compositor.begin_frame(disable_overlays) {
                *last_commit_failed_update = true;
                return Err(FrameError::BeginFrame(err));
            }
            for state in current_composition_planes
                .iter_mut()
                .filter(|s| s.needs_offscreen_composition() && !s.surface_recycled())
            {
                if let Err(err) = manager.prepare_draw_target(state) {
                    *last_commit_failed_update = true;
                    return Err(FrameError::Plane(err));
                }
            }
            let rects: Vec<Rectangle<i32>> = layers.iter().map(|l| l.display_frame()).collect();
            if let Err(err) = compositor.draw(&mut current_composition_planes, &layers, &rects) {
                *last_commit_failed_update = true;
                return Err(FrameError::Draw(err));
            }
        } else if handle_raw_pixel_update {
            if let Err(err) = shared.compositor.lock().unwrap().ensure_pixel_data_updated() {
                warn!("raw pixel flush failed: {err}");
            }
        }

        if cfg!(not(feature = "double-buffering")) {
            // The previous frame's buffers are about to be replaced; the
            // out-fence must have signalled before their owners reuse them.
            if let Some(fence) = kms_fence.take() {
                if let Err(err) = fence.wait() {
                    *last_commit_failed_update = true;
                    return Err(FrameError::FenceWait(err));
                }
            }
        }

        {
            let mut state = shared.state.lock().unwrap();
            if state.contains(QueueState::NEEDS_COLOR_CORRECTION) {
                display.set_color_correction(*gamma, *contrast, *brightness);
                display.set_color_transform_matrix(color_transform_matrix, *color_transform_hint);
                state.remove(QueueState::NEEDS_COLOR_CORRECTION);
            }
        }

        let out_fence = match display.commit(
            &current_composition_planes,
            previous_plane_state,
            disable_overlays,
        ) {
            Ok(fence) => fence,
            Err(err) => {
                *last_commit_failed_update = true;
                return Err(FrameError::Commit(err));
            }
        };

        // Retired surfaces that were still on screen last frame can be freed
        // now; anything a plane reclaimed meanwhile stays alive.
        for surface in mark_not_inuse.drain(..) {
            if !surface.in_use() {
                surface.set_age(-1);
            }
        }

        std::mem::swap(in_flight_layers, &mut layers);
        std::mem::swap(previous_plane_state, &mut current_composition_planes);
        update_on_screen_surfaces(previous_plane_state);

        let mut still_aging = Vec::new();
        for surface in surfaces_not_inuse.drain(..) {
            if surface.in_use() {
                continue;
            }
            if surface.age() > 0 {
                surface.set_age(surface.age() - 1);
                still_aging.push(surface);
            } else {
                mark_not_inuse.push(surface);
            }
        }
        *surfaces_not_inuse = still_aging;

        let cloned_mode;
        if idle_frame {
            manager.release_free_offscreen_targets();
            let mut state = shared.state.lock().unwrap();
            state.remove(QueueState::MARK_SURFACES_FOR_RELEASE | QueueState::RELEASE_SURFACES);
            state.insert(QueueState::LAST_FRAME_IDLE_UPDATE);
            cloned_mode = state.contains(QueueState::CLONED_MODE);
            drop(state);
            if cloned_mode {
                shared.idle.lock().unwrap().tracker.state |= FrameState::RENDER_IDLE_DISPLAY;
            }
        } else {
            let mut state = shared.state.lock().unwrap();
            state.remove(QueueState::LAST_FRAME_IDLE_UPDATE);
            cloned_mode = state.contains(QueueState::CLONED_MODE);
            drop(state);
            release_surfaces_as_needed(manager, &shared.state, validate_layers);
        }

        let mut retire_fence = None;
        if let Some(fence) = out_fence {
            if !cloned_mode {
                match fence.duplicate() {
                    Ok(dup) => retire_fence = Some(dup),
                    Err(err) => warn!("failed to duplicate retire fence: {err}"),
                }
            }
            set_release_fence_to_layers(&fence, previous_plane_state, in_flight_layers, source_layers);
            *kms_fence = Some(fence);
        }

        if cfg!(feature = "double-buffering") {
            if let Some(fence) = kms_fence.take() {
                if let Err(err) = fence.wait() {
                    // The frame is on its way to the screen regardless.
                    warn!("kms fence wait failed: {err}");
                }
            }
        }

        if *handle_display_initializations {
            *handle_display_initializations = false;
            display.handle_lazy_initialization();
        }

        tracker.complete(previous_plane_state.len(), idle_frame, render_layers);
        Ok(retire_fence)
    }
}

/// Copy the previous frame's plane assignment, patching in removals, damage
/// and geometry updates (spelled out in the module docs as the incremental
/// path).
fn get_cached_layers(
    manager: &mut DisplayPlaneManager,
    previous_plane_state: &[DisplayPlaneState],
    layers: &[OverlayLayer],
    remove_index: Option<usize>,
    composition: &mut Vec<DisplayPlaneState>,
    surfaces_not_inuse: &mut Vec<SurfaceHandle>,
) -> Result<CachedLayers, PlaneError> {
    let gpu_fd = manager.gpu_fd().clone();
    let mut needs_gpu_composition = false;
    let mut ignore_commit = true;
    let mut check_to_squash = false;
    let mut plane_validation = false;
    let mut only_cursor_rect_changed = true;
    // A scanout plane whose frame changed invalidates the composition
    // regions of the planes composited after it.
    let mut reset_composition_regions = false;

    for previous_plane in previous_plane_state {
        let mut clear_surface = false;
        let mut last_plane = previous_plane.copy_state();

        if let Some(threshold) = remove_index {
            if last_plane.top_source_layer() >= threshold {
                let has_one_layer = last_plane.source_layers().len() == 1;
                if !has_one_layer {
                    last_plane.reset_layers(threshold);
                    clear_surface = true;
                }
                // The new layer combination may change scaler usage; never
                // skip this commit.
                ignore_commit = false;

                if last_plane.source_layers().is_empty() || has_one_layer {
                    manager.mark_surfaces_for_recycling(
                        &mut last_plane,
                        surfaces_not_inuse,
                        false,
                    );
                    // Disabling the primary can take down the whole pipe on
                    // some hardware; re-validate instead.
                    if last_plane.plane().id() == previous_plane_state[0].plane().id() {
                        return Ok(CachedLayers::force_full());
                    }
                    continue;
                }

                last_plane.validate_revalidation();
                if last_plane
                    .revalidation_type()
                    .contains(RevalidationType::SCANOUT)
                {
                    let layer = &layers[last_plane.source_layers()[0]];
                    if layer.can_scan_out() && last_plane.needs_offscreen_composition() {
                        plane_validation = true;
                    } else if last_plane.source_layers().len() == 1 {
                        check_to_squash = true;
                        last_plane.revalidation_done(RevalidationType::SCANOUT);
                    }
                }
            }
        }

        if last_plane.needs_offscreen_composition() {
            let mut surface_damage: Rectangle<i32> = Rectangle::default();
            let mut update_rect = false;
            let mut update_source_rect = false;
            let full_reset = clear_surface || reset_composition_regions;
            let mut refresh_surfaces = reset_composition_regions;

            if !clear_surface {
                for source_index in last_plane.source_layers().to_vec() {
                    let layer = &layers[source_index];
                    if layer.has_dimensions_changed() {
                        last_plane.update_display_frame(layer.display_frame(), layer.needs_full_draw());
                        if !layer.is_cursor() {
                            only_cursor_rect_changed = false;
                        }
                        update_rect = true;
                    }
                    if layer.has_source_rect_changed() {
                        last_plane.update_source_crop(layer.source_crop(), layer.needs_full_draw());
                        if !layer.is_cursor() {
                            only_cursor_rect_changed = false;
                        }
                        update_source_rect = true;
                    }
                    if full_reset || refresh_surfaces {
                        continue;
                    }
                    refresh_surfaces = layer.needs_full_draw();
                    if layer.has_content_changed() {
                        surface_damage = surface_damage.merge(layer.surface_damage());
                    }
                }
            }

            if update_rect || update_source_rect || clear_surface {
                last_plane.validate_revalidation();
                if !last_plane.revalidation_type().is_empty() {
                    plane_validation = true;
                }
            }

            if full_reset
                || !surface_damage.is_empty()
                || update_rect
                || update_source_rect
                || refresh_surfaces
            {
                if last_plane.needs_surface_allocation() {
                    manager.set_offscreen_plane_target(&mut last_plane)?;
                } else if full_reset || refresh_surfaces {
                    last_plane.refresh_surfaces(ClearKind::Full, refresh_surfaces);
                } else {
                    last_plane.update_damage(surface_damage);
                }
            }

            if !needs_gpu_composition {
                needs_gpu_composition = !last_plane.surface_recycled();
            }
            reset_composition_regions = false;
        } else {
            reset_composition_regions = false;
            let layer = &layers[last_plane.source_layers()[0]];
            match layer.buffer() {
                Some(buffer) => {
                    if buffer.framebuffer().is_none() {
                        if buffer.ensure_framebuffer(&gpu_fd).is_err() {
                            // No framebuffer means no scanout; start over.
                            return Ok(CachedLayers::force_full());
                        }
                        reset_composition_regions = true;
                    }
                }
                None => return Ok(CachedLayers::force_full()),
            }
            last_plane.set_overlay_layer(layer);
            if layer.has_content_changed() {
                ignore_commit = false;
            }
            if layer.has_dimensions_changed() || layer.needs_revalidation() || layer.needs_full_draw()
            {
                ignore_commit = false;
                reset_composition_regions = true;
            }
        }

        composition.push(last_plane);
    }

    if needs_gpu_composition {
        ignore_commit = false;
    }

    // Squash the last overlay into its predecessor (cursor plane excluded)
    // when both hold a single squashable layer, freeing one plane.
    if check_to_squash {
        let mut size = composition.len();
        if composition.last().map(|s| s.is_cursor_plane()).unwrap_or(false) {
            size -= 1;
        }
        if size > 2 {
            let can_squash = {
                let old_plane = &composition[size - 2];
                let last_overlay = &composition[size - 1];
                old_plane.can_squash()
                    && last_overlay.can_squash()
                    && old_plane.source_layers().len() == 1
                    && last_overlay.source_layers().len() == 1
            };
            if can_squash {
                let mut last_overlay = composition.remove(size - 1);
                let moved_layer = last_overlay.source_layers()[0];
                debug!(layer = moved_layer, "squashing top overlay into predecessor");
                composition[size - 2].add_layer(&layers[moved_layer]);
                manager.set_offscreen_plane_target(&mut composition[size - 2])?;
                if !last_overlay.surfaces().is_empty() {
                    manager.mark_surfaces_for_recycling(
                        &mut last_overlay,
                        surfaces_not_inuse,
                        false,
                    );
                }
                // The merged plane renders fresh content this frame.
                needs_gpu_composition = true;
                ignore_commit = false;
            }
        }
    }

    Ok(CachedLayers {
        render_layers: needs_gpu_composition,
        can_ignore_commit: ignore_commit,
        needs_plane_validation: plane_validation,
        force_full_validation: false,
        only_cursor_rect_changed,
    })
}

/// Propagate a video-effect toggle into the video planes of the composition.
fn set_media_effects_state(
    manager: &mut DisplayPlaneManager,
    apply_effects: bool,
    layers: &[OverlayLayer],
    composition: &mut [DisplayPlaneState],
    surfaces_not_inuse: &mut Vec<SurfaceHandle>,
) -> Result<(), PlaneError> {
    for plane in composition.iter_mut() {
        if !plane.is_video_plane() {
            continue;
        }
        plane.set_apply_effects(apply_effects);
        if apply_effects && plane.surfaces().is_empty() {
            // The plane scans out directly; effects need a render target.
            manager.set_offscreen_plane_target(plane)?;
        } else if !apply_effects && !plane.surfaces().is_empty() {
            let layer = &layers[plane.source_layers()[0]];
            if plane.source_layers().len() == 1 && layer.can_scan_out() {
                // Back to direct scanout; targets age out through the queue.
                manager.mark_surfaces_for_recycling(plane, surfaces_not_inuse, false);
                plane.set_scanout(layer);
            }
        }
    }
    Ok(())
}

/// Re-stamp surface ages after a commit so they encode LRU order within each
/// plane's target set.
fn update_on_screen_surfaces(previous_plane_state: &mut [DisplayPlaneState]) {
    for plane_state in previous_plane_state.iter() {
        let surfaces = plane_state.surfaces();
        match surfaces.len() {
            0 => {}
            3 => {
                surfaces[0].set_age(2);
                surfaces[1].set_age(0);
                surfaces[2].set_age(1);
            }
            len => {
                for (i, surface) in surfaces.iter().enumerate() {
                    surface.set_age((len - 1 - i) as i32);
                }
            }
        }
    }
}

/// Hand out release fences for the frame that just left the screen.
///
/// Scanout layers get a duplicate of the commit's out-fence. Composited
/// layers are released by the GPU pass instead: they get a duplicate of the
/// composition acquire fence, falling back to their own acquire fence.
fn set_release_fence_to_layers(
    fence: &SyncFence,
    previous_plane_state: &[DisplayPlaneState],
    in_flight_layers: &mut [OverlayLayer],
    source_layers: &mut [HwcLayer],
) {
    for plane in previous_plane_state {
        if plane.scanout() && !plane.surface_recycled() {
            for &idx in plane.source_layers() {
                let overlay = &mut in_flight_layers[idx];
                overlay.set_composition(CompositionKind::Display);
                match fence.duplicate() {
                    Ok(dup) => source_layers[overlay.layer_index()].set_release_fence(Some(dup)),
                    Err(err) => warn!("failed to duplicate release fence: {err}"),
                }
            }
        } else {
            let composition_fence = plane.composition_fence();
            for &idx in plane.source_layers() {
                let overlay = &mut in_flight_layers[idx];
                overlay.set_composition(CompositionKind::Gpu);
                let release = match &composition_fence {
                    Some(fence) => fence.duplicate().ok(),
                    None => overlay.release_acquire_fence(),
                };
                if let Some(release) = release {
                    source_layers[overlay.layer_index()].set_release_fence(Some(release));
                }
            }
            // `composition_fence` drops here: the original is closed exactly
            // once after the duplicates went out.
        }
    }
}

/// The deferred release pipeline: a validation marks targets, a stable frame
/// promotes the mark, the next stable frame frees them.
fn release_surfaces_as_needed(
    manager: &mut DisplayPlaneManager,
    state: &Mutex<QueueState>,
    layers_validated: bool,
) {
    let release_now = {
        let state = state.lock().unwrap();
        !layers_validated && state.contains(QueueState::RELEASE_SURFACES)
    };
    if release_now {
        manager.release_free_offscreen_targets();
        state
            .lock()
            .unwrap()
            .remove(QueueState::MARK_SURFACES_FOR_RELEASE | QueueState::RELEASE_SURFACES);
    }

    let mut state = state.lock().unwrap();
    if state.contains(QueueState::MARK_SURFACES_FOR_RELEASE) {
        state.insert(QueueState::RELEASE_SURFACES);
        state.remove(QueueState::MARK_SURFACES_FOR_RELEASE);
    }
    if layers_validated {
        state.insert(QueueState::MARK_SURFACES_FOR_RELEASE);
        state.remove(QueueState::RELEASE_SURFACES);
    }
}

#[cfg(test)]
impl DisplayQueue {
    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight_layers.len()
    }

    pub(crate) fn previous_planes(&self) -> &[DisplayPlaneState] {
        &self.previous_plane_state
    }

    pub(crate) fn state_bits(&self) -> QueueState {
        *self.shared.state.lock().unwrap()
    }

    pub(crate) fn surfaces_not_inuse_len(&self) -> usize {
        self.surfaces_not_inuse.len()
    }
}

#[cfg(test)]
mod tests;
