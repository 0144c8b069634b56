//! Buffers handed out by the bus between dequeue and requeue

use std::os::fd::{BorrowedFd, RawFd};
use std::ptr::NonNull;

use bytes::Bytes;

use crate::capture::format::VideoFormat;
use crate::capture::frame::{Point, Rect};

/// Transport backing a data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Process-local memory.
    MemPtr,
    /// Shared-memory file descriptor, mappable.
    MemFd,
    /// GPU-importable DMA-BUF descriptor.
    DmaBuf,
    Invalid,
    Other(u32),
}

impl DataKind {
    pub fn id(self) -> u32 {
        match self {
            DataKind::MemPtr => 1,
            DataKind::MemFd => 2,
            DataKind::DmaBuf => 3,
            DataKind::Invalid => u32::MAX,
            DataKind::Other(id) => id,
        }
    }
}

/// Valid region of a data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
}

#[derive(Debug, Clone)]
pub struct DataPlane {
    pub kind: DataKind,
    fd: Option<RawFd>,
    pub map_offset: u32,
    pub max_size: u32,
    data: Option<(NonNull<u8>, usize)>,
    pub chunk: Chunk,
}

impl DataPlane {
    pub fn new(kind: DataKind, max_size: u32, chunk: Chunk) -> Self {
        Self {
            kind,
            fd: None,
            map_offset: 0,
            max_size,
            data: None,
            chunk,
        }
    }

    /// Attach the descriptor backing this plane.
    ///
    /// # Safety
    ///
    /// `fd` must stay open until the buffer is queued back to the session it
    /// was dequeued from.
    pub unsafe fn set_fd(&mut self, fd: RawFd) {
        self.fd = (fd >= 0).then_some(fd);
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        // SAFETY: set_fd's contract keeps the descriptor open for as long as
        // the buffer (and so this borrow) is checked out.
        self.fd.map(|fd| unsafe { BorrowedFd::borrow_raw(fd) })
    }

    /// Attach the process-local memory of a [`DataKind::MemPtr`] plane.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that stay valid until the
    /// buffer is queued back to the session it was dequeued from.
    pub unsafe fn set_data(&mut self, ptr: *const u8, len: usize) {
        self.data = NonNull::new(ptr.cast_mut()).map(|ptr| (ptr, len));
    }

    pub fn data(&self) -> Option<&[u8]> {
        // SAFETY: set_data's contract, same as for `fd`.
        self.data
            .map(|(ptr, len)| unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaHeader {
    pub flags: u32,
    pub pts: i64,
    pub dts_offset: i64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaBitmap {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub stride: i32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaCursor {
    /// Zero means the cursor meta carries no valid cursor.
    pub id: u32,
    pub position: Point,
    pub hotspot: Point,
    /// Set only when the cursor image changed since the last buffer.
    pub bitmap: Option<MetaBitmap>,
}

impl MetaCursor {
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

/// A dequeued buffer. Owned by the stream only until it is queued back.
#[derive(Debug, Clone)]
pub struct BusBuffer {
    pub id: u32,
    pub datas: Vec<DataPlane>,
    pub header: Option<MetaHeader>,
    pub damage: Option<Vec<Rect>>,
    pub cursor: Option<MetaCursor>,
}

impl BusBuffer {
    pub fn new(id: u32, datas: Vec<DataPlane>) -> Self {
        Self {
            id,
            datas,
            header: None,
            damage: None,
            cursor: None,
        }
    }
}
