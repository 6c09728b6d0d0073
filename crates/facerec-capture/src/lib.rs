//! facerec-capture — Frame acquisition.
//!
//! Sources are pull-based: the caller asks for the current frame when it
//! wants one. Frames are packed RGB8.

pub mod frame;
pub mod source;

pub use frame::{Frame, FrameError};
pub use source::{CaptureError, DirectorySource, Facing, FrameSource, StillImageSource};
