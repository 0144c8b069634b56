pub mod format;
pub mod frame;
pub mod ingest;

pub use format::VideoFormat;
pub use frame::{
    CursorSnapshot, DmaBufAttributes, DmaBufPlane, Frame, LocalImage, Payload, PixelBuffer, Region,
};
pub use ingest::BufferIngester;
