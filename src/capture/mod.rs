pub mod encode;
pub mod frame;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameLedger, FrameMetadata, PixelFormat};
pub use source::{
    DeviceHandle, DeviceId, Source, SourceBackend, SourceError, SourceFactory, SourceProvider,
};
pub use synthetic::SyntheticSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
