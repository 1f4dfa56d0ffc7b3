//! Mock collaborators shared by the unit tests.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use drm_fourcc::DrmFourcc;

use crate::buffer::{BufferDescriptor, BufferUsage, NativeBufferHandler, NativeHandle, ResourceManager};
use crate::compositor::{
    CompositionPass, DeinterlaceControl, DeinterlaceFlag, RenderBackend, VideoColorControl,
    VideoColorValue,
};
use crate::display::{ColorMatrix, ColorTransformHint, GammaCurve, PhysicalDisplay};
use crate::error::{CommitError, PlaneError, RenderError};
use crate::layer::{HwcLayer, OverlayLayer};
use crate::plane::{DisplayPlane, DisplayPlaneState, PlaneHandler, PlaneType};
use crate::sync::{signalled_fence, SyncFence};
use crate::utils::{DeviceFd, Rectangle, Transform};

pub(crate) fn test_device_fd() -> DeviceFd {
    let file = std::fs::File::open("/dev/null").expect("open /dev/null");
    DeviceFd::from(std::os::unix::io::OwnedFd::from(file))
}

pub(crate) fn test_layer(handle: NativeHandle, loc: (i32, i32), size: (i32, i32)) -> HwcLayer {
    let mut layer = HwcLayer::new(handle);
    layer.set_display_frame(Rectangle::from_loc_and_size(loc, size));
    layer.set_source_crop(Rectangle::from_loc_and_size(
        (0.0, 0.0),
        (size.0 as f32, size.1 as f32),
    ));
    layer
}

pub(crate) fn overlay_layers(layers: &mut [HwcLayer]) -> Vec<OverlayLayer> {
    overlay_layers_with(Arc::new(TestBufferHandler::default()), layers)
}

pub(crate) fn overlay_layers_with(
    handler: Arc<TestBufferHandler>,
    layers: &mut [HwcLayer],
) -> Vec<OverlayLayer> {
    let mut resources = ResourceManager::new(handler);
    layers
        .iter_mut()
        .enumerate()
        .map(|(z, layer)| {
            OverlayLayer::from_hwc_layer(
                layer,
                &mut resources,
                None,
                z,
                z,
                None,
                Transform::empty(),
                false,
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TestBufferConfig {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
    pub usage: BufferUsage,
    pub scanout_capable: bool,
}

impl Default for TestBufferConfig {
    fn default() -> Self {
        TestBufferConfig {
            width: 1920,
            height: 1080,
            format: DrmFourcc::Xrgb8888,
            usage: BufferUsage::Normal,
            scanout_capable: true,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TestBufferHandler {
    buffers: Mutex<HashMap<NativeHandle, TestBufferConfig>>,
    next_fb: AtomicU32,
    fail_framebuffers: AtomicBool,
    imports: AtomicUsize,
    allocations: AtomicUsize,
    created_fbs: AtomicUsize,
    released_fbs: AtomicUsize,
    released_buffers: AtomicUsize,
}

impl TestBufferHandler {
    pub fn insert_buffer(&self, handle: NativeHandle, config: TestBufferConfig) {
        self.buffers.lock().unwrap().insert(handle, config);
    }

    pub fn fail_framebuffers(&self, fail: bool) {
        self.fail_framebuffers.store(fail, Ordering::SeqCst);
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn created_framebuffers(&self) -> usize {
        self.created_fbs.load(Ordering::SeqCst)
    }

    pub fn released_framebuffers(&self) -> usize {
        self.released_fbs.load(Ordering::SeqCst)
    }

    pub fn released_buffers(&self) -> usize {
        self.released_buffers.load(Ordering::SeqCst)
    }

    fn descriptor(&self, handle: Option<NativeHandle>, config: TestBufferConfig) -> BufferDescriptor {
        BufferDescriptor {
            handle,
            width: config.width,
            height: config.height,
            format: config.format,
            prime_fd: None,
            pitches: [config.width * 4, 0, 0, 0],
            offsets: [0; 4],
            gem_handles: [0; 4],
            num_planes: 1,
            usage: config.usage,
            scanout_capable: config.scanout_capable,
        }
    }
}

impl NativeBufferHandler for TestBufferHandler {
    fn import_buffer(&self, handle: NativeHandle) -> Result<BufferDescriptor, crate::error::BufferError> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        let config = self
            .buffers
            .lock()
            .unwrap()
            .get(&handle)
            .copied()
            .unwrap_or_default();
        Ok(self.descriptor(Some(handle), config))
    }

    fn allocate_buffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
    ) -> Result<BufferDescriptor, crate::error::BufferError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        let config = TestBufferConfig {
            width,
            height,
            format,
            ..Default::default()
        };
        Ok(self.descriptor(None, config))
    }

    fn create_frame_buffer(
        &self,
        buffer: &BufferDescriptor,
        _gpu_fd: &DeviceFd,
    ) -> Result<NonZeroU32, crate::error::BufferError> {
        if self.fail_framebuffers.load(Ordering::SeqCst) {
            return Err(crate::error::BufferError::FramebufferFailed(
                buffer.handle.unwrap_or(0),
            ));
        }
        self.created_fbs.fetch_add(1, Ordering::SeqCst);
        let id = self.next_fb.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NonZeroU32::new(id).expect("fb ids start at 1"))
    }

    fn release_frame_buffer(&self, _fb: NonZeroU32) {
        self.released_fbs.fetch_add(1, Ordering::SeqCst);
    }

    fn release_buffer(&self, _buffer: &BufferDescriptor) {
        self.released_buffers.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PlaneHandlerState {
    pub accept_commits: AtomicBool,
    pub test_commits: AtomicUsize,
}

#[derive(Debug, Clone)]
pub(crate) struct TestPlaneHandler {
    primaries: usize,
    overlays: usize,
    state: Arc<PlaneHandlerState>,
}

impl TestPlaneHandler {
    pub fn with_planes(primaries: usize, overlays: usize, accept_commits: bool) -> Self {
        let state = PlaneHandlerState {
            accept_commits: AtomicBool::new(accept_commits),
            test_commits: AtomicUsize::new(0),
        };
        TestPlaneHandler {
            primaries,
            overlays,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<PlaneHandlerState> {
        self.state.clone()
    }
}

impl PlaneHandler for TestPlaneHandler {
    fn populate_planes(&mut self) -> Result<Vec<DisplayPlane>, PlaneError> {
        let formats = vec![DrmFourcc::Xrgb8888, DrmFourcc::Argb8888];
        let mut planes = Vec::new();
        for i in 0..self.primaries {
            planes.push(DisplayPlane::new(1 + i as u32, PlaneType::Primary, formats.clone()));
        }
        for i in 0..self.overlays {
            planes.push(DisplayPlane::new(10 + i as u32, PlaneType::Overlay, formats.clone()));
        }
        planes.push(DisplayPlane::new(100, PlaneType::Cursor, formats));
        Ok(planes)
    }

    fn supports_layer(&self, plane: &DisplayPlane, layer: &OverlayLayer) -> bool {
        match plane.plane_type() {
            PlaneType::Cursor => layer.is_cursor(),
            _ => !layer.is_cursor(),
        }
    }

    fn test_commit(&self, _proposal: &[DisplayPlaneState]) -> bool {
        self.state.test_commits.fetch_add(1, Ordering::SeqCst);
        self.state.accept_commits.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub(crate) struct DisplayLog {
    pub commits: Mutex<Vec<usize>>,
    pub fail_next_commit: AtomicBool,
    pub color_pushes: AtomicUsize,
    pub matrix_pushes: AtomicUsize,
    pub disables: AtomicUsize,
    pub lazy_inits: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TestDisplay {
    log: Arc<DisplayLog>,
}

impl TestDisplay {
    pub fn log(&self) -> Arc<DisplayLog> {
        self.log.clone()
    }
}

impl PhysicalDisplay for TestDisplay {
    fn commit(
        &mut self,
        current: &[DisplayPlaneState],
        _previous: &[DisplayPlaneState],
        _disable_overlays: bool,
    ) -> Result<Option<SyncFence>, CommitError> {
        if self.log.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(CommitError::Rejected);
        }
        self.log.commits.lock().unwrap().push(current.len());
        Ok(Some(signalled_fence()))
    }

    fn disable(&mut self, _previous: &[DisplayPlaneState]) {
        self.log.disables.fetch_add(1, Ordering::SeqCst);
    }

    fn set_color_correction(&mut self, _gamma: GammaCurve, _contrast: u32, _brightness: u32) {
        self.log.color_pushes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_color_transform_matrix(&mut self, _matrix: &ColorMatrix, _hint: ColorTransformHint) {
        self.log.matrix_pushes.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_lazy_initialization(&mut self) {
        self.log.lazy_inits.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) struct DrawRecord {
    pub sources: usize,
    pub apply_effects: bool,
}

#[derive(Debug, Default)]
pub(crate) struct BackendLog {
    pub inits: AtomicUsize,
    pub begin_frames: AtomicUsize,
    pub draws: Mutex<Vec<DrawRecord>>,
    pub uploads: AtomicUsize,
    pub flushes: AtomicUsize,
    pub resets: AtomicUsize,
    pub fail_draws: AtomicBool,
    pub video_colors: Mutex<HashMap<VideoColorControl, f32>>,
    pub scaling_mode: AtomicU32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TestBackend {
    log: Arc<BackendLog>,
}

impl TestBackend {
    pub fn log(&self) -> Arc<BackendLog> {
        self.log.clone()
    }
}

impl RenderBackend for TestBackend {
    fn init(&mut self, _gpu_fd: &DeviceFd) -> Result<(), RenderError> {
        self.log.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn begin_frame(&mut self, _disable_explicit_sync: bool) -> Result<(), RenderError> {
        self.log.begin_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn draw(&mut self, pass: CompositionPass<'_>) -> Result<Option<SyncFence>, RenderError> {
        if self.log.fail_draws.load(Ordering::SeqCst) {
            return Err(RenderError::BadFrame);
        }
        self.log.draws.lock().unwrap().push(DrawRecord {
            sources: pass.sources.len(),
            apply_effects: pass.apply_effects,
        });
        Ok(Some(signalled_fence()))
    }

    fn upload_raw_pixels(&mut self, uploads: &[crate::layer::RawPixelUpload]) -> Result<(), RenderError> {
        self.log.uploads.fetch_add(uploads.len(), Ordering::SeqCst);
        Ok(())
    }

    fn flush_uploads(&mut self) -> Result<(), RenderError> {
        self.log.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_video_color(&mut self, control: VideoColorControl, value: f32) {
        self.log.video_colors.lock().unwrap().insert(control, value);
    }

    fn video_color(&self, control: VideoColorControl) -> VideoColorValue {
        let value = self
            .log
            .video_colors
            .lock()
            .unwrap()
            .get(&control)
            .copied()
            .unwrap_or(0.0);
        VideoColorValue {
            value,
            start: -100.0,
            end: 100.0,
        }
    }

    fn restore_video_default_color(&mut self, control: VideoColorControl) {
        self.log.video_colors.lock().unwrap().remove(&control);
    }

    fn set_video_deinterlace(&mut self, _flag: DeinterlaceFlag, _mode: DeinterlaceControl) {}

    fn restore_video_default_deinterlace(&mut self) {}

    fn set_video_scaling_mode(&mut self, mode: u32) {
        self.log.scaling_mode.store(mode, Ordering::SeqCst);
    }

    fn reset(&mut self) {
        self.log.resets.fetch_add(1, Ordering::SeqCst);
    }
}
