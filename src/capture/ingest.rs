//! Turns one dequeued bus buffer into a [`Frame`]

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use image::{Rgba, RgbaImage};
use memmap2::MmapOptions;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::bus::{BusBuffer, DataKind, DataPlane, MetaCursor, NegotiatedFormat};
use crate::capture::format::{VideoFormat, DRM_FORMAT_MOD_INVALID};
use crate::capture::frame::{
    CursorSnapshot, DmaBufAttributes, DmaBufPlane, Frame, LocalImage, Payload, PixelBuffer, Region,
};
use crate::utils;
use crate::Config;

/// Most planes a DMA-BUF descriptor can carry.
pub const MAX_DMABUF_PLANES: usize = 4;

/// Reasons a buffer's image could not be extracted. Never fatal to the stream.
#[derive(Error, Debug)]
enum IngestError {
    #[error("buffer has no data planes")]
    NoPlanes,

    #[error("plane has no file descriptor")]
    MissingFd,

    #[error("plane has no mapped memory")]
    MissingData,

    #[error("failed to mmap buffer: {0}")]
    Map(#[from] io::Error),

    #[error("invalid stride {stride} for {width}px rows")]
    BadStride { stride: i32, width: u32 },

    #[error("image needs {needed} bytes but plane has {available}")]
    OutOfBounds { needed: usize, available: usize },

    #[error("image size overflows")]
    Overflow,

    #[error("{count} planes exceed the DMA-BUF limit of {MAX_DMABUF_PLANES}")]
    TooManyPlanes { count: usize },
}

/// Stateless per-buffer extraction.
#[derive(Debug, Clone)]
pub struct BufferIngester {
    config: Arc<Config>,
}

impl BufferIngester {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Build the frame for `buffer` under the fixed `video` format.
    ///
    /// Always yields a frame. Zero-copy planes in the result borrow from
    /// `buffer` and die with it; the caller requeues the buffer right after.
    #[instrument(level = "trace", skip_all, fields(buffer = buffer.id))]
    pub fn handle<'a>(&self, buffer: &'a BusBuffer, video: &NegotiatedFormat) -> Frame<'a> {
        let started = Instant::now();

        let (presentation_timestamp, sequence) = match &buffer.header {
            Some(header) => (header.pts, Some(header.seq)),
            None => (utils::wall_clock_nanos(), None),
        };

        let damage = buffer.damage.as_ref().map(|rects| {
            let mut region = Region::default();
            for rect in rects {
                region.add(*rect);
            }
            region
        });

        let cursor = buffer.cursor.as_ref().and_then(cursor_snapshot);
        let payload = self.payload(buffer, video);

        metrics::counter!("frames_received").increment(1);
        metrics::histogram!("ingest_time_us").record(started.elapsed().as_micros() as f64);

        Frame {
            format: video.format,
            sequence,
            presentation_timestamp,
            payload,
            damage,
            cursor,
        }
    }

    fn payload<'a>(&self, buffer: &'a BusBuffer, video: &NegotiatedFormat) -> Payload<'a> {
        let Some(primary) = buffer.datas.first() else {
            return self.degraded(IngestError::NoPlanes);
        };

        if primary.chunk.size == 0 {
            // Nothing new this cycle.
            return Payload::None;
        }

        match primary.kind {
            DataKind::MemFd => match map_shared_memory(primary, video) {
                Ok(image) => Payload::Image(image),
                Err(e) => {
                    warn!("Dropping shared-memory frame: {}", e);
                    metrics::counter!("frames_degraded").increment(1);
                    Payload::None
                }
            },
            DataKind::DmaBuf => match dmabuf_attributes(buffer, video) {
                Ok(attribs) => Payload::DmaBuf(attribs),
                Err(e) => {
                    warn!("Dropping DMA-BUF frame: {}", e);
                    metrics::counter!("frames_degraded").increment(1);
                    Payload::None
                }
            },
            DataKind::MemPtr => match wrap_local_memory(primary, video) {
                Ok(image) => Payload::Local(image),
                Err(e) => {
                    warn!("Dropping local-memory frame: {}", e);
                    metrics::counter!("frames_degraded").increment(1);
                    Payload::None
                }
            },
            DataKind::Invalid => {
                debug!("invalid buffer type");
                Payload::Image(self.error_marker())
            }
            DataKind::Other(kind) => {
                debug!("unsupported buffer type {}", kind);
                Payload::Image(self.error_marker())
            }
        }
    }

    fn degraded(&self, error: IngestError) -> Payload<'static> {
        warn!("Unusable buffer: {}", error);
        metrics::counter!("frames_degraded").increment(1);
        Payload::Image(self.error_marker())
    }

    /// Solid red square shown in place of frames we cannot read.
    pub fn error_marker(&self) -> PixelBuffer {
        let size = self.config.frame.error_marker_size;
        let image = RgbaImage::from_pixel(size, size, Rgba([255, 0, 0, 255]));
        PixelBuffer {
            width: size,
            height: size,
            stride: size * 4,
            format: VideoFormat::Rgba,
            data: Bytes::from(image.into_raw()),
        }
    }
}

fn row_layout(stride: i32, video: &NegotiatedFormat) -> Result<(usize, usize), IngestError> {
    let width = video.size.width;
    let row_bytes = (width as usize)
        .checked_mul(video.format.bytes_per_pixel() as usize)
        .ok_or(IngestError::Overflow)?;
    match usize::try_from(stride) {
        Ok(s) if s >= row_bytes => Ok((s, row_bytes)),
        _ => Err(IngestError::BadStride { stride, width }),
    }
}

/// Bytes spanned by `height` rows, the last one unpadded.
fn image_span(stride: usize, row_bytes: usize, height: u32) -> Option<usize> {
    match height {
        0 => Some(0),
        h => stride.checked_mul(h as usize - 1)?.checked_add(row_bytes),
    }
}

/// Offset one past the image that starts `start` bytes into a plane.
fn image_end(
    start: usize,
    stride: usize,
    row_bytes: usize,
    height: u32,
) -> Result<usize, IngestError> {
    image_span(stride, row_bytes, height)
        .and_then(|span| span.checked_add(start))
        .ok_or(IngestError::Overflow)
}

/// Copy the image out of a shared-memory plane. The mapping lives only for
/// the duration of this call.
fn map_shared_memory(
    plane: &DataPlane,
    video: &NegotiatedFormat,
) -> Result<PixelBuffer, IngestError> {
    let fd = plane.fd().ok_or(IngestError::MissingFd)?;
    let (stride, row_bytes) = row_layout(plane.chunk.stride, video)?;
    let height = video.size.height;

    let map_len = plane.max_size as usize + plane.map_offset as usize;
    let start = plane.map_offset as usize + plane.chunk.offset as usize;
    let needed = image_end(start, stride, row_bytes, height)?;
    if needed > map_len {
        return Err(IngestError::OutOfBounds {
            needed,
            available: map_len,
        });
    }

    // SAFETY: private read-only mapping of a descriptor the bus keeps open
    // while the buffer is checked out; concurrent writers can only change
    // pixel values, which we copy out before unmapping.
    let map = unsafe { MmapOptions::new().len(map_len).map_copy_read_only(&fd)? };

    let mut pixels = BytesMut::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let row = start + y * stride;
        pixels.extend_from_slice(&map[row..row + row_bytes]);
    }
    drop(map);

    Ok(PixelBuffer {
        width: video.size.width,
        height,
        stride: row_bytes as u32,
        format: video.format,
        data: pixels.freeze(),
    })
}

fn dmabuf_attributes<'a>(
    buffer: &'a BusBuffer,
    video: &NegotiatedFormat,
) -> Result<DmaBufAttributes<'a>, IngestError> {
    let count = buffer.datas.len();
    if count > MAX_DMABUF_PLANES {
        return Err(IngestError::TooManyPlanes { count });
    }

    let planes = buffer
        .datas
        .iter()
        .map(|data| {
            Ok(DmaBufPlane {
                fd: data.fd().ok_or(IngestError::MissingFd)?,
                offset: data.chunk.offset,
                stride: u32::try_from(data.chunk.stride).map_err(|_| IngestError::BadStride {
                    stride: data.chunk.stride,
                    width: video.size.width,
                })?,
            })
        })
        .collect::<Result<Vec<_>, IngestError>>()?;

    Ok(DmaBufAttributes {
        width: video.size.width,
        height: video.size.height,
        format: video.format.to_drm_fourcc(),
        modifier: video.modifier.unwrap_or(DRM_FORMAT_MOD_INVALID),
        planes,
    })
}

/// Wrap process-local memory without copying.
fn wrap_local_memory<'a>(
    plane: &'a DataPlane,
    video: &NegotiatedFormat,
) -> Result<LocalImage<'a>, IngestError> {
    let data = plane.data().ok_or(IngestError::MissingData)?;
    let (stride, row_bytes) = row_layout(plane.chunk.stride, video)?;

    let start = plane.chunk.offset as usize;
    let needed = image_end(start, stride, row_bytes, video.size.height)?;
    let data = data.get(start..needed).ok_or(IngestError::OutOfBounds {
        needed,
        available: data.len(),
    })?;

    Ok(LocalImage {
        width: video.size.width,
        height: video.size.height,
        stride: stride as u32,
        format: video.format,
        data,
    })
}

fn cursor_snapshot(meta: &MetaCursor) -> Option<CursorSnapshot> {
    if !meta.is_valid() {
        return None;
    }

    let bitmap = meta
        .bitmap
        .as_ref()
        .filter(|b| b.width > 0 && b.height > 0)
        .and_then(|b| {
            let stride = u32::try_from(b.stride).ok()?;
            let row_bytes = b.width.checked_mul(b.format.bytes_per_pixel())?;
            if row_bytes > stride {
                return None;
            }
            let span = image_span(stride as usize, row_bytes as usize, b.height)?;
            // Copy out: meta memory belongs to the bus buffer.
            Some(PixelBuffer {
                width: b.width,
                height: b.height,
                stride,
                format: b.format,
                data: Bytes::copy_from_slice(b.data.get(..span)?),
            })
        });

    Some(CursorSnapshot {
        position: meta.position,
        hotspot: meta.hotspot,
        bitmap,
    })
}
