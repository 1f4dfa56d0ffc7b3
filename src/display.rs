//! The kernel display adapter contract and display-level value types.

use crate::error::CommitError;
use crate::plane::DisplayPlaneState;
use crate::sync::SyncFence;

/// Display power modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// Pipe disabled
    Off,
    /// Low-power display of static content
    Doze,
    /// Doze with the update loop suspended
    DozeSuspend,
    /// Fully on
    On,
}

/// One rotation step requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// No rotation
    None,
    /// Rotate by 90 degrees
    Rotate90,
    /// Rotate by 180 degrees
    Rotate180,
    /// Rotate by 270 degrees
    Rotate270,
}

/// Per-channel gamma correction, 1.0 is linear.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaCurve {
    /// Red exponent
    pub red: f32,
    /// Green exponent
    pub green: f32,
    /// Blue exponent
    pub blue: f32,
}

impl Default for GammaCurve {
    fn default() -> Self {
        GammaCurve {
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        }
    }
}

/// A 4x4 color transform matrix in row-major order.
pub type ColorMatrix = [f32; 16];

/// What shape of color transform the caller handed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorTransformHint {
    /// Identity, no transform needed
    Identical,
    /// Use the full matrix
    ArbitraryMatrix,
}

/// The kernel driver adapter for one physical display.
///
/// Implementations translate plane configurations into atomic commits. The
/// queue guarantees that `commit` is called with a configuration previously
/// accepted by the plane handler's test path.
pub trait PhysicalDisplay: Send {
    /// Atomically realize `current`, replacing `previous`. Returns the
    /// out-fence of the commit, if the driver produced one; it signals when
    /// the configuration reached the screen.
    fn commit(
        &mut self,
        current: &[DisplayPlaneState],
        previous: &[DisplayPlaneState],
        disable_overlays: bool,
    ) -> Result<Option<SyncFence>, CommitError>;

    /// Disable all planes of `previous`.
    fn disable(&mut self, previous: &[DisplayPlaneState]);

    /// Push gamma, contrast and brightness. Contrast and brightness pack
    /// three 8-bit channels as `0xRRGGBB`.
    fn set_color_correction(&mut self, gamma: GammaCurve, contrast: u32, brightness: u32);

    /// Push the color transform matrix.
    fn set_color_transform_matrix(&mut self, matrix: &ColorMatrix, hint: ColorTransformHint);

    /// One-shot hook invoked after the first successful commit.
    fn handle_lazy_initialization(&mut self);
}

impl std::fmt::Debug for dyn PhysicalDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PhysicalDisplay")
    }
}
