//! Errors surfaced by the composition pipeline.

use std::io;

/// Errors thrown while importing or realizing buffers.
#[derive(thiserror::Error, Debug)]
pub enum BufferError {
    /// The native handle is unknown to the buffer backend
    #[error("Unknown native buffer handle `{0}`")]
    UnknownHandle(u64),
    /// Creating a scan-out framebuffer object failed
    #[error("Failed to create a framebuffer object for buffer `{0}`")]
    FramebufferFailed(u64),
    /// Allocating an offscreen render target failed
    #[error("Failed to allocate a {width}x{height} offscreen target")]
    AllocationFailed {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },
    /// The buffer backend encountered a device error
    #[error("Buffer backend access error")]
    Access(#[source] io::Error),
}

/// Errors thrown by the display plane manager.
#[derive(thiserror::Error, Debug)]
pub enum PlaneError {
    /// The plane handler reported no usable planes
    #[error("Display reports no primary plane")]
    NoPrimaryPlane,
    /// Querying planes from the display failed
    #[error("Failed to query display planes")]
    QueryFailed(#[source] io::Error),
    /// Offscreen surface allocation failed
    #[error("Offscreen surface allocation failed")]
    Surface(#[from] BufferError),
}

/// Errors thrown by the GPU render backend.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// The backend could not be initialized
    #[error("Render backend initialization failed")]
    InitFailed(#[source] io::Error),
    /// Starting the composition frame failed
    #[error("Render backend rejected the frame")]
    BadFrame,
    /// Drawing an offscreen target failed
    #[error("Drawing offscreen target failed")]
    DrawFailed(#[source] io::Error),
    /// Uploading raw pixel data failed
    #[error("Raw pixel upload failed")]
    UploadFailed(#[source] io::Error),
}

/// Errors thrown when committing a plane configuration to the display.
#[derive(thiserror::Error, Debug)]
pub enum CommitError {
    /// The driver rejected the proposed plane configuration
    #[error("Atomic commit rejected by the display driver")]
    Rejected,
    /// The commit ioctl failed
    #[error("Display device access error")]
    Access(#[source] io::Error),
}

/// Errors thrown by [`DisplayQueue::initialize`](crate::DisplayQueue::initialize).
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    /// Plane manager initialization failed
    #[error("Failed to initialize the display plane manager")]
    PlaneManager(#[from] PlaneError),
}

/// Errors thrown by [`DisplayQueue::queue_update`](crate::DisplayQueue::queue_update).
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    /// The queue has not been initialized yet
    #[error("Display queue is not initialized")]
    NotInitialized,
    /// The GPU composition pass could not be started
    #[error("Failed to begin the composition frame")]
    BeginFrame(#[source] RenderError),
    /// The GPU composition pass failed
    #[error("Failed to prepare the frame composition")]
    Draw(#[source] RenderError),
    /// The atomic commit failed
    #[error("Failed to commit the plane configuration")]
    Commit(#[source] CommitError),
    /// Plane or offscreen-target bookkeeping failed mid-frame
    #[error("Plane bookkeeping failed")]
    Plane(#[from] PlaneError),
    /// Waiting on the kms out-fence failed
    #[error("Waiting on the kms out-fence failed")]
    FenceWait(#[source] io::Error),
}
