//! Pixel formats understood by the stream engine and their DRM equivalents

use serde::{Deserialize, Serialize};

/// Memory-layout modifier meaning "let the driver pick the layout implicitly".
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;
/// Plain linear layout.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_INVALID: u32 = 0;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b"AR24");
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b"XR24");
pub const DRM_FORMAT_ABGR8888: u32 = fourcc(b"AB24");
pub const DRM_FORMAT_XBGR8888: u32 = fourcc(b"XB24");
pub const DRM_FORMAT_RGB888: u32 = fourcc(b"RG24");
pub const DRM_FORMAT_BGR888: u32 = fourcc(b"BG24");

/// Raw video formats, named by byte order in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoFormat {
    Rgbx,
    Rgba,
    Bgrx,
    Bgra,
    Rgb,
    Bgr,
    /// Any other bus format id, carried through untouched.
    Other(u32),
}

impl VideoFormat {
    /// Formats offered during negotiation, most preferred first.
    pub const SUPPORTED: [VideoFormat; 6] = [
        VideoFormat::Rgbx,
        VideoFormat::Rgba,
        VideoFormat::Bgrx,
        VideoFormat::Bgra,
        VideoFormat::Rgb,
        VideoFormat::Bgr,
    ];

    /// Bus-side numeric id.
    pub fn id(self) -> u32 {
        match self {
            VideoFormat::Rgbx => 7,
            VideoFormat::Bgrx => 8,
            VideoFormat::Rgba => 11,
            VideoFormat::Bgra => 12,
            VideoFormat::Rgb => 15,
            VideoFormat::Bgr => 16,
            VideoFormat::Other(id) => id,
        }
    }

    pub fn from_id(id: u32) -> Self {
        match id {
            7 => VideoFormat::Rgbx,
            8 => VideoFormat::Bgrx,
            11 => VideoFormat::Rgba,
            12 => VideoFormat::Bgra,
            15 => VideoFormat::Rgb,
            16 => VideoFormat::Bgr,
            other => VideoFormat::Other(other),
        }
    }

    pub fn to_drm_fourcc(self) -> u32 {
        match self {
            VideoFormat::Rgba => DRM_FORMAT_ABGR8888,
            VideoFormat::Rgbx => DRM_FORMAT_XBGR8888,
            VideoFormat::Bgra => DRM_FORMAT_ARGB8888,
            VideoFormat::Bgrx => DRM_FORMAT_XRGB8888,
            VideoFormat::Bgr => DRM_FORMAT_BGR888,
            VideoFormat::Rgb => DRM_FORMAT_RGB888,
            VideoFormat::Other(id) => {
                tracing::debug!("unknown format {}", id);
                DRM_FORMAT_INVALID
            }
        }
    }

    /// Bytes per pixel; unknown formats are assumed to be 32-bit.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            VideoFormat::Rgb | VideoFormat::Bgr => 3,
            _ => 4,
        }
    }
}
