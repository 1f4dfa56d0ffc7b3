use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;
use crate::buffer::BufferUsage;
use crate::compositor::VideoColorControl;
use crate::layer::LayerContent;
use crate::test_utils::{
    test_device_fd, test_layer, BackendLog, DisplayLog, PlaneHandlerState, TestBackend,
    TestBufferConfig, TestBufferHandler, TestDisplay, TestPlaneHandler,
};

struct TestQueue {
    queue: DisplayQueue,
    display: Arc<DisplayLog>,
    backend: Arc<BackendLog>,
    buffers: Arc<TestBufferHandler>,
    planes: Arc<PlaneHandlerState>,
}

fn make_queue(overlays: usize) -> TestQueue {
    let buffers = Arc::new(TestBufferHandler::default());
    let display = TestDisplay::default();
    let backend = TestBackend::default();
    let plane_handler = TestPlaneHandler::with_planes(1, overlays, true);
    let planes = plane_handler.state();
    let mut queue = DisplayQueue::new(
        test_device_fd(),
        false,
        buffers.clone(),
        Box::new(display.clone()),
        Box::new(backend.clone()),
    );
    queue
        .initialize(0, 1920, 1080, Box::new(plane_handler))
        .unwrap();
    queue.set_power_mode(PowerMode::On);
    TestQueue {
        queue,
        display: display.log(),
        backend: backend.log(),
        buffers,
        planes,
    }
}

fn commits(t: &TestQueue) -> usize {
    t.display.commits.lock().unwrap().len()
}

fn draws(t: &TestQueue) -> usize {
    t.backend.draws.lock().unwrap().len()
}

#[test]
fn queue_update_before_initialize_fails() {
    let buffers = Arc::new(TestBufferHandler::default());
    let mut queue = DisplayQueue::new(
        test_device_fd(),
        false,
        buffers,
        Box::new(TestDisplay::default()),
        Box::new(TestBackend::default()),
    );
    let mut layers = vec![test_layer(1, (0, 0), (64, 64))];
    assert!(matches!(
        queue.queue_update(&mut layers, false, false),
        Err(FrameError::NotInitialized)
    ));
}

// Two identical frames with one full-screen opaque layer: the second frame
// takes the incremental path and produces no commit.
#[test]
fn steady_state_suppresses_the_second_commit() {
    let mut t = make_queue(2);
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];

    let retire = t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(retire.is_some());
    assert_eq!(commits(&t), 1);
    assert_eq!(t.queue.in_flight_len(), 1);
    assert_eq!(t.queue.previous_planes().len(), 1);
    assert!(layers[0].take_release_fence().is_some());

    let retire = t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(retire.is_none());
    assert_eq!(commits(&t), 1);
    assert_eq!(t.queue.in_flight_len(), 1);
    assert!(layers[0].take_release_fence().is_none());
    assert_eq!(draws(&t), 0);
}

// After a successful frame neither plane state nor in-flight layers are
// empty; after power-off they are.
#[test]
fn successful_frame_publishes_state() {
    let mut t = make_queue(1);
    let mut layers = vec![
        test_layer(1, (0, 0), (1920, 1080)),
        {
            let mut hidden = test_layer(2, (0, 0), (64, 64));
            hidden.set_visible(false);
            hidden
        },
    ];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    // Only visible layers survive into the frame snapshot.
    assert_eq!(t.queue.in_flight_len(), 1);
    assert!(!t.queue.previous_planes().is_empty());
}

// A cursor appearing on top takes the incremental path and lands on the
// cursor plane; a cursor that cannot scan out is rendered by the GPU.
#[test]
fn cursor_appears_incrementally() {
    let mut t = make_queue(2);
    t.buffers.insert_buffer(
        2,
        TestBufferConfig {
            width: 64,
            height: 64,
            usage: BufferUsage::Cursor,
            scanout_capable: false,
            ..Default::default()
        },
    );
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert_eq!(t.queue.previous_planes().len(), 1);

    let mut layers = vec![
        test_layer(1, (0, 0), (1920, 1080)),
        test_layer(2, (100, 100), (64, 64)),
    ];
    let retire = t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(retire.is_some());
    assert_eq!(commits(&t), 2);
    let planes = t.queue.previous_planes();
    assert_eq!(planes.len(), 2);
    assert!(planes[1].is_cursor_plane());
    // The software cursor went through the composition pass.
    assert!(draws(&t) >= 1);
}

// Toggling a video effect between two frames forces full validation and a
// GPU pass over the video plane.
#[test]
fn video_effect_toggle_forces_media_composition() {
    let mut t = make_queue(2);
    t.buffers.insert_buffer(
        5,
        TestBufferConfig {
            width: 1280,
            height: 720,
            usage: BufferUsage::Video,
            ..Default::default()
        },
    );
    let mut layers = vec![test_layer(5, (0, 0), (1280, 720))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(t.queue.previous_planes()[0].scanout());
    assert_eq!(draws(&t), 0);

    t.queue.set_video_color(VideoColorControl::Brightness, 10.0);
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert_eq!(commits(&t), 2);
    let planes = t.queue.previous_planes();
    assert!(planes[0].needs_offscreen_composition());
    assert!(!planes[0].surfaces().is_empty());
    let draw_log = t.backend.draws.lock().unwrap();
    assert!(draw_log.iter().any(|d| d.apply_effects));
    drop(draw_log);

    // Restoring the default flips the plane back to direct scanout.
    t.queue
        .restore_video_default_color(VideoColorControl::Brightness);
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(t.queue.previous_planes()[0].scanout());
}

// A failed commit publishes nothing and the following frame re-validates.
#[test]
fn commit_failure_forces_full_validation_next_frame() {
    let mut t = make_queue(2);
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    let validations_before = t.planes.test_commits.load(Ordering::SeqCst);

    t.display.fail_next_commit.store(true, Ordering::SeqCst);
    layers[0].set_content(LayerContent::Buffer(2));
    let err = t.queue.queue_update(&mut layers, false, false);
    assert!(matches!(err, Err(FrameError::Commit(_))));
    assert_eq!(commits(&t), 1);
    assert_eq!(t.queue.in_flight_len(), 1);
    assert_eq!(t.queue.previous_planes().len(), 1);
    assert!(layers[0].take_release_fence().is_none());
    // No incremental work ran for the failed content update.
    assert_eq!(t.planes.test_commits.load(Ordering::SeqCst), validations_before);

    let retire = t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(retire.is_some());
    assert_eq!(commits(&t), 2);
    // The recovery frame went through the full validation path.
    assert_eq!(
        t.planes.test_commits.load(Ordering::SeqCst),
        validations_before + 1
    );
}

// Idle detection: after IDLE_FRAMES idle vblanks the refresh callback fires
// exactly once, and the following idle update collapses the planes and
// releases free targets.
#[test]
fn idle_vblanks_fire_one_refresh_then_render_idle_frame() {
    let mut t = make_queue(2);
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();
    t.queue
        .register_refresh_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }), 0);

    // Prime with one layer so the two-layer frame takes the incremental
    // path and keeps both planes.
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    let mut layers = vec![
        test_layer(1, (0, 0), (1920, 1080)),
        test_layer(2, (1000, 100), (400, 400)),
    ];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert_eq!(t.queue.previous_planes().len(), 2);

    for _ in 0..IDLE_FRAMES {
        t.queue.handle_idle_case();
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }
    t.queue.handle_idle_case();
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    t.queue.handle_idle_case();
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    let retire = t.queue.queue_update(&mut layers, true, false).unwrap();
    assert!(retire.is_some());
    // The idle composition squeezed everything onto one plane via the GPU.
    assert_eq!(t.queue.previous_planes().len(), 1);
    assert!(t.queue.previous_planes()[0].needs_offscreen_composition());
    assert!(draws(&t) >= 1);
    assert!(t
        .queue
        .state_bits()
        .contains(QueueState::LAST_FRAME_IDLE_UPDATE));
}

// Removing the middle layer squashes the top overlay into the one below,
// erasing one plane state and recycling its targets.
#[test]
fn removal_squashes_top_overlay_into_predecessor() {
    let mut t = make_queue(2);
    for handle in [3u64, 4u64] {
        t.buffers.insert_buffer(
            handle,
            TestBufferConfig {
                width: 400,
                height: 400,
                scanout_capable: false,
                ..Default::default()
            },
        );
    }

    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();

    let mut layers = vec![
        test_layer(1, (0, 0), (1920, 1080)),
        test_layer(2, (0, 0), (400, 400)),
        test_layer(3, (500, 0), (400, 400)),
        test_layer(4, (900, 0), (400, 400)),
    ];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert_eq!(t.queue.previous_planes().len(), 3);
    assert!(t.queue.previous_planes()[2].needs_offscreen_composition());

    let mut layers = vec![
        test_layer(1, (0, 0), (1920, 1080)),
        test_layer(2, (0, 0), (400, 400)),
        test_layer(3, (500, 0), (400, 400)),
    ];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    let planes = t.queue.previous_planes();
    assert_eq!(planes.len(), 2);
    assert!(planes[1].needs_offscreen_composition());
    assert_eq!(planes[1].source_layers(), &[1, 2]);
    // The erased plane's targets entered the recycling queue.
    assert!(t.queue.surfaces_not_inuse_len() >= 1);
}

// Ignored updates return success without committing or touching state.
#[test]
fn ignored_updates_touch_nothing() {
    let mut t = make_queue(1);
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    layers[0].take_release_fence();

    t.queue.ignore_updates();
    layers[0].set_content(LayerContent::Buffer(2));
    let retire = t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(retire.is_none());
    assert_eq!(commits(&t), 1);
    assert!(layers[0].take_release_fence().is_none());

    // force_refresh lifts the gate and the next frame fully revalidates.
    t.queue.force_refresh();
    let retire = t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(retire.is_some());
    assert_eq!(commits(&t), 2);
}

#[test]
fn handle_exit_is_idempotent() {
    let mut t = make_queue(1);
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();

    t.queue.set_power_mode(PowerMode::Off);
    let bits_after_first = t.queue.state_bits();
    assert!(!bits_after_first.contains(QueueState::POWERED_ON));
    assert!(bits_after_first.contains(QueueState::CONFIGURATION_CHANGED));
    assert_eq!(t.display.disables.load(Ordering::SeqCst), 1);
    assert_eq!(t.queue.in_flight_len(), 0);
    assert!(t.queue.previous_planes().is_empty());

    t.queue.set_power_mode(PowerMode::Off);
    assert_eq!(t.queue.state_bits(), bits_after_first);
    // Nothing was left to disable the second time around.
    assert_eq!(t.display.disables.load(Ordering::SeqCst), 1);
}

// Power off and on again: the next commit pushes color correction and
// clears the configuration flag.
#[test]
fn power_cycle_reapplies_color_correction() {
    let mut t = make_queue(1);
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert_eq!(t.display.color_pushes.load(Ordering::SeqCst), 1);

    t.queue.set_power_mode(PowerMode::Off);
    t.queue.set_power_mode(PowerMode::On);
    assert!(t
        .queue
        .state_bits()
        .contains(QueueState::NEEDS_COLOR_CORRECTION));

    t.queue.queue_update(&mut layers, false, false).unwrap();
    let bits = t.queue.state_bits();
    assert_eq!(t.display.color_pushes.load(Ordering::SeqCst), 2);
    assert!(!bits.contains(QueueState::NEEDS_COLOR_CORRECTION));
    assert!(!bits.contains(QueueState::CONFIGURATION_CHANGED));
}

// Surface ages stay a permutation of 0..len as a composited plane ramps up
// to triple buffering.
#[test]
fn surface_ages_form_a_permutation_every_frame() {
    let mut t = make_queue(0);
    let mut layers = vec![
        test_layer(1, (0, 0), (1920, 1080)),
        test_layer(100, (0, 0), (400, 400)),
    ];
    for frame in 0..6u64 {
        layers[1].set_content(LayerContent::Buffer(100 + frame));
        t.queue.queue_update(&mut layers, false, false).unwrap();
        for plane in t.queue.previous_planes() {
            let mut ages: Vec<i32> = plane.surfaces().iter().map(|s| s.age()).collect();
            if ages.is_empty() {
                continue;
            }
            ages.sort_unstable();
            let expected: Vec<i32> = (0..plane.surfaces().len() as i32).collect();
            assert_eq!(ages, expected, "frame {frame}");
        }
    }
    // The plane reached steady-state triple buffering.
    let plane = &t.queue.previous_planes()[0];
    assert!(plane.needs_offscreen_composition());
    assert_eq!(plane.surfaces().len(), 3);
}

// Composited layers get the composition acquire fence as their release
// fence, scanout layers a duplicate of the out-fence.
#[test]
fn release_fences_reach_every_layer() {
    let mut t = make_queue(0);
    let mut layers = vec![
        test_layer(1, (0, 0), (1920, 1080)),
        test_layer(2, (0, 0), (400, 400)),
    ];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    // Both layers were composited into the primary target.
    assert!(layers[0].take_release_fence().is_some());
    assert!(layers[1].take_release_fence().is_some());
    assert!(layers[0].take_release_fence().is_none());
}

#[test]
fn cloned_mode_withholds_the_retire_fence() {
    let mut t = make_queue(1);
    t.queue.set_clone_mode(true);
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    let retire = t.queue.queue_update(&mut layers, false, false).unwrap();
    assert!(retire.is_none());
    assert_eq!(commits(&t), 1);

    t.queue.set_clone_mode(false);
    assert!(t
        .queue
        .state_bits()
        .contains(QueueState::CONFIGURATION_CHANGED));
}

#[test]
fn scaling_ratio_expands_display_frames() {
    let mut t = make_queue(1);
    // 960x540 primary content shown on a 1920x1080 display.
    t.queue.update_scaling_ratio(960, 540, 1920, 1080);
    let mut layers = vec![test_layer(1, (0, 0), (960, 540))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    let frame = t.queue.previous_planes()[0].display_frame();
    assert_eq!(frame, Rectangle::from_loc_and_size((0, 0), (1920, 1080)));
}

#[test]
fn lazy_display_initialization_runs_once() {
    let mut t = make_queue(1);
    let mut layers = vec![test_layer(1, (0, 0), (1920, 1080))];
    t.queue.queue_update(&mut layers, false, false).unwrap();
    layers[0].set_content(LayerContent::Buffer(2));
    t.queue.queue_update(&mut layers, false, false).unwrap();
    assert_eq!(t.display.lazy_inits.load(Ordering::SeqCst), 1);
}
