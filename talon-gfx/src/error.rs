//! Error types.
//!
//! The public surface of this crate never panics on a caller mistake or a recoverable driver
//! condition; everything comes back through [`Error`]/[`Result`]. Internally, multi-step
//! construction code (device/context/swapchain setup) still uses `anyhow::Result` and `.context()`
//! for readable causal chains, then converts to a typed [`Error`] at the public boundary via
//! `.map_err(Error::external)` or one of the `From` impls below.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy surfaced by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller passed an argument that can never be valid, regardless of device/context state
    /// (e.g. an empty vertex buffer spec, a render target format that isn't a render target
    /// format).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The arguments were individually fine, but the operation doesn't make sense given the
    /// current state of the object it was called on (e.g. committing a vertex buffer with no
    /// render pass committed, mapping a buffer twice).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The host or device is out of memory, or a fixed-size pool (descriptor heap, command pool)
    /// could not grow to satisfy the request.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Something below us (the driver, the windowing system, the shader compiler) failed. The
    /// original error is preserved as the source.
    #[error("external error: {0:#}")]
    External(#[source] anyhow::Error),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Error::OutOfMemory(msg.into())
    }

    /// Wrap any lower-level error (driver, anyhow-context chain, etc) as an [`Error::External`].
    pub fn external(err: impl Into<anyhow::Error>) -> Self {
        Error::External(err.into())
    }
}

impl From<hal::device::OutOfMemory> for Error {
    fn from(e: hal::device::OutOfMemory) -> Self {
        Error::OutOfMemory(e.to_string())
    }
}

impl From<hal::device::AllocationError> for Error {
    fn from(e: hal::device::AllocationError) -> Self {
        match e {
            hal::device::AllocationError::OutOfMemory(oom) => Error::from(oom),
            other => Error::External(anyhow::anyhow!(other)),
        }
    }
}

impl From<hal::device::WaitError> for Error {
    fn from(e: hal::device::WaitError) -> Self {
        match e {
            hal::device::WaitError::OutOfMemory(oom) => Error::from(oom),
            hal::device::WaitError::DeviceLost(_) => Error::external(anyhow::anyhow!(e)),
        }
    }
}

impl From<hal::device::MapError> for Error {
    fn from(e: hal::device::MapError) -> Self {
        match e {
            hal::device::MapError::OutOfMemory(oom) => Error::from(oom),
            other => Error::InvalidOperation(other.to_string()),
        }
    }
}

impl From<hal::window::SurfaceError> for Error {
    fn from(e: hal::window::SurfaceError) -> Self {
        match e {
            hal::window::SurfaceError::OutOfMemory(oom) => Error::from(oom),
            other => Error::External(anyhow::anyhow!(other)),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::External(e)
    }
}

/// Internal detail: which lock was found poisoned. Always surfaced as [`Error::External`], since
/// a poisoned lock means some other thread already panicked while touching shared device state.
#[derive(Error, Debug)]
pub enum LockPoisoned {
    #[error("device lock poisoned")]
    Device,

    #[error("queue lock poisoned")]
    Queue,

    #[error("memory pool lock poisoned")]
    MemoryPool,

    #[error("descriptor pool lock poisoned")]
    DescriptorPool,

    #[error("fence lock poisoned")]
    Fence,
}

/// Internal detail: a property search over the adapter/surface came up empty. Surfaced as
/// [`Error::External`], since it reflects the physical device/driver, not caller input.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("no supported color format")]
    ColorFormat,

    #[error("no supported depth format")]
    DepthFormat,

    #[error("no supported present mode")]
    PresentMode,

    #[error("no supported composite alpha mode")]
    CompositeAlphaMode,

    #[error("no suitable queue families found")]
    NoSuitableFamilies,

    #[error("no suitable memory types found")]
    NoMemoryTypes,

    #[error("no suitable queues")]
    NoQueues,

    #[error("memory pool missing")]
    MemoryPoolMissing,
}

/// Internal detail: the caller used an API in a way its own preconditions forbid. Surfaced as
/// [`Error::InvalidOperation`].
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("attempt to create mappable memory block from non-mappable memory")]
    NonMappableMemory,

    #[error("called get_queue without properly requesting the queue beforehand")]
    QueueNegotiatorMisuse,

    #[error("no render pass committed")]
    NoRenderPassCommitted,

    #[error("no pipeline committed")]
    NoPipelineCommitted,

    #[error("buffer is not currently mapped")]
    BufferNotMapped,

    #[error("buffer is already mapped")]
    BufferAlreadyMapped,

    #[error("resource heap is exhausted and cannot grow further")]
    ResourceHeapExhausted,
}

impl From<EnvironmentError> for Error {
    fn from(e: EnvironmentError) -> Self {
        Error::External(anyhow::anyhow!(e))
    }
}

impl From<UsageError> for Error {
    fn from(e: UsageError) -> Self {
        Error::InvalidOperation(e.to_string())
    }
}

impl From<LockPoisoned> for Error {
    fn from(e: LockPoisoned) -> Self {
        Error::External(anyhow::anyhow!(e.to_string()))
    }
}

/// Render a full anyhow-style causal chain, for logging at the point an [`Error::External`] is
/// about to be returned.
pub fn full_error_display(err: &anyhow::Error) -> String {
    let cont = err
        .chain()
        .skip(1)
        .map(|cause| format!("    caused by: {}", cause))
        .collect::<Vec<String>>()
        .join("\n");

    format!("Error: {}\n{}", err, cont)
}
