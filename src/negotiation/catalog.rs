//! Per-format catalog of GPU-importable memory-layout modifiers

use tracing::{debug, warn};

use crate::capture::format::{VideoFormat, DRM_FORMAT_INVALID, DRM_FORMAT_MOD_INVALID};

/// GPU-side capability provider (e.g. the EGL display of the renderer).
pub trait DmaBufCapabilities {
    /// Whether DMA-BUF import is available at all.
    fn can_import(&self) -> bool;

    /// DRM fourccs importable by the GPU, `None` if the query is unavailable
    /// or failed.
    fn formats(&self) -> Option<Vec<u32>>;

    /// Modifiers importable for `drm_format`, `None` if the query failed.
    fn modifiers(&self, drm_format: u32) -> Option<Vec<u64>>;
}

/// Provider for renderers without DMA-BUF import.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDmaBuf;

impl DmaBufCapabilities for NoDmaBuf {
    fn can_import(&self) -> bool {
        false
    }

    fn formats(&self) -> Option<Vec<u32>> {
        None
    }

    fn modifiers(&self, _drm_format: u32) -> Option<Vec<u64>> {
        None
    }
}

/// Ordered modifier lists per format, in format priority order.
///
/// Entries only ever shrink. An empty list means zero-copy import is off for
/// that format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifierCatalog {
    entries: Vec<(VideoFormat, Vec<u64>)>,
}

impl ModifierCatalog {
    pub fn query(caps: &dyn DmaBufCapabilities, formats: &[VideoFormat]) -> Self {
        let implicit_only = vec![DRM_FORMAT_MOD_INVALID];

        if !caps.can_import() {
            debug!("GPU cannot import DMA-BUFs, catalog stays empty");
            return Self {
                entries: formats.iter().map(|f| (*f, Vec::new())).collect(),
            };
        }

        let Some(drm_formats) = caps.formats() else {
            warn!("Failed to query DMA-BUF formats");
            return Self {
                entries: formats.iter().map(|f| (*f, implicit_only.clone())).collect(),
            };
        };

        let entries = formats
            .iter()
            .map(|&format| {
                let drm_format = format.to_drm_fourcc();
                if drm_format == DRM_FORMAT_INVALID {
                    debug!("No DRM format for {:?}", format);
                    return (format, Vec::new());
                }
                if !drm_formats.contains(&drm_format) {
                    debug!("Format {:#x} not supported for modifiers", drm_format);
                    return (format, implicit_only.clone());
                }
                let Some(reported) = caps.modifiers(drm_format) else {
                    warn!("Failed to query DMA-BUF modifiers for {:#x}", drm_format);
                    return (format, implicit_only.clone());
                };

                let mut modifiers: Vec<u64> = Vec::with_capacity(reported.len() + 1);
                for m in reported.into_iter().chain([DRM_FORMAT_MOD_INVALID]) {
                    if !modifiers.contains(&m) {
                        modifiers.push(m);
                    }
                }
                (format, modifiers)
            })
            .collect();

        Self { entries }
    }

    /// Build a catalog from explicit lists, deduplicated in order.
    pub fn from_entries(entries: impl IntoIterator<Item = (VideoFormat, Vec<u64>)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(format, list)| {
                    let mut unique = Vec::with_capacity(list.len());
                    for m in list {
                        if !unique.contains(&m) {
                            unique.push(m);
                        }
                    }
                    (format, unique)
                })
                .collect(),
        }
    }

    /// True until the first query.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (VideoFormat, &[u64])> + '_ {
        self.entries.iter().map(|(f, m)| (*f, m.as_slice()))
    }

    pub fn modifiers(&self, format: VideoFormat) -> &[u64] {
        self.entries
            .iter()
            .find(|(f, _)| *f == format)
            .map_or(&[], |(_, m)| m.as_slice())
    }

    /// Whether zero-copy import is permanently off for `format`.
    pub fn is_exhausted(&self, format: VideoFormat) -> bool {
        self.modifiers(format).is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|(_, m)| m.len()).sum()
    }

    /// Drop `modifier` for `format`. Returns whether anything was removed.
    pub fn remove(&mut self, format: VideoFormat, modifier: u64) -> bool {
        let Some((_, modifiers)) = self.entries.iter_mut().find(|(f, _)| *f == format) else {
            return false;
        };
        let before = modifiers.len();
        modifiers.retain(|m| *m != modifier);
        let removed = modifiers.len() != before;
        if removed && modifiers.is_empty() {
            warn!("No modifiers left for {:?}, falling back to shared memory", format);
        }
        removed
    }
}
