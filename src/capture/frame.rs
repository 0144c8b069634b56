use std::os::fd::BorrowedFd;

use bytes::Bytes;

use super::format::VideoFormat;

/// One delivered buffer, as seen by the consumer.
///
/// The lifetime ties zero-copy plane handles to the buffer the frame was
/// built from; the bus reclaims them as soon as the frame callback returns.
#[derive(Debug)]
pub struct Frame<'a> {
    pub format: VideoFormat,
    /// Source sequence number, when the header meta carried one.
    pub sequence: Option<u64>,
    /// Presentation timestamp in nanoseconds.
    pub presentation_timestamp: i64,
    pub payload: Payload<'a>,
    pub damage: Option<Region>,
    pub cursor: Option<CursorSnapshot>,
}

/// Image content of a frame. At most one transport kind is ever populated.
#[derive(Debug, Default)]
pub enum Payload<'a> {
    /// No new image this cycle; keep presenting the previous one.
    #[default]
    None,
    DmaBuf(DmaBufAttributes<'a>),
    /// Pixels owned by the frame: shared-memory copies and the error marker.
    Image(PixelBuffer),
    /// Process-local pixels borrowed from the bus buffer.
    Local(LocalImage<'a>),
}

impl Payload<'_> {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DmaBufPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: u32,
}

/// Zero-copy buffer descriptor, valid only for the duration of the frame callback.
#[derive(Debug, Clone)]
pub struct DmaBufAttributes<'a> {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc of the negotiated format.
    pub format: u32,
    /// Shared by every plane.
    pub modifier: u64,
    pub planes: Vec<DmaBufPlane<'a>>,
}

/// CPU-side pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: VideoFormat,
    pub data: Bytes,
}

impl PixelBuffer {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes of one row, without stride padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel() as usize;
        self.data.get(start..start + len)
    }
}

/// Pixels still owned by the bus, valid only for the duration of the frame
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalImage<'a> {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: VideoFormat,
    pub data: &'a [u8],
}

impl LocalImage<'_> {
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel() as usize;
        self.data.get(start..start + len)
    }

    /// Copy the pixels out so they can outlive the callback.
    pub fn to_pixel_buffer(&self) -> PixelBuffer {
        PixelBuffer {
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }
}

/// Damaged area of a frame. Rectangles may overlap; consumers union them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn add(&mut self, rect: Rect) {
        if !rect.is_empty() {
            self.rects.push(rect);
        }
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Smallest rectangle covering every damaged area. Extents that do not
    /// fit a `u32` are clamped.
    pub fn bounding_rect(&self) -> Option<Rect> {
        let first = self.rects.first()?;
        let (mut x0, mut y0) = (first.x, first.y);
        let (mut x1, mut y1) = (first.right(), first.bottom());
        for r in &self.rects[1..] {
            x0 = x0.min(r.x);
            y0 = y0.min(r.y);
            x1 = x1.max(r.right());
            y1 = y1.max(r.bottom());
        }
        let extent = |from: i32, to: i64| u32::try_from(to - i64::from(from)).unwrap_or(u32::MAX);
        Some(Rect {
            x: x0,
            y: y0,
            width: extent(x0, x1),
            height: extent(y0, y1),
        })
    }
}

/// Cursor overlay state attached to a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub position: Point,
    pub hotspot: Point,
    /// Only present when the cursor image changed since the previous snapshot.
    pub bitmap: Option<PixelBuffer>,
}
