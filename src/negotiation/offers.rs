//! Capability offers and buffer/meta parameters sent to the bus

use std::sync::Arc;

use tracing::debug;

use crate::bus::{
    BufferParams, DataKind, DataTypeMask, FormatOffer, IntRange, MetaKind, MetaParam,
    ModifierProperty, NegotiatedFormat, Param, Size,
};
use crate::capture::format::{VideoFormat, DRM_FORMAT_MOD_INVALID};
use crate::Config;

use super::{ModifierCatalog, NegotiationFlags};

/// Size of the header meta: flags, offset, pts, dts offset, sequence.
pub const HEADER_META_SIZE: u32 = 32;
const CURSOR_META_HEADER_SIZE: u32 = 28;
const BITMAP_META_HEADER_SIZE: u32 = 20;
const CURSOR_BPP: u32 = 4;
/// One damage rectangle: position + size.
pub const REGION_META_SIZE: u32 = 16;

/// Bytes needed for a cursor meta carrying a `width`x`height` bitmap.
pub const fn cursor_meta_size(width: u32, height: u32) -> u32 {
    CURSOR_META_HEADER_SIZE + BITMAP_META_HEADER_SIZE + width * height * CURSOR_BPP
}

/// Builds everything the stream sends to the bus while negotiating.
#[derive(Debug, Clone)]
pub struct StreamNegotiator {
    config: Arc<Config>,
}

impl StreamNegotiator {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Offers for every catalogued format, in priority order.
    ///
    /// For each format the modifier-bearing offer (when allowed) comes first,
    /// followed by an unconstrained shared-memory offer. The bus takes the
    /// first mutually acceptable one.
    pub fn build_offers(
        &self,
        catalog: &ModifierCatalog,
        flags: NegotiationFlags,
    ) -> Vec<FormatOffer> {
        let mut offers = Vec::new();
        for (format, modifiers) in catalog.entries() {
            if flags.allow_dmabuf && !modifiers.is_empty() {
                offers.push(build_format(format, modifiers, flags.dont_fixate));
            }
            offers.push(build_format(format, &[], flags.dont_fixate));
        }
        debug!(
            "Built {} format offers (dmabuf: {}, dont_fixate: {})",
            offers.len(),
            flags.allow_dmabuf,
            flags.dont_fixate
        );
        offers
    }

    /// Whether DMA-BUF transport may be requested for the fixed `format`.
    ///
    /// Needs zero-copy to be allowed for the stream, the peer to have kept the
    /// modifier property, and modifiers left in the catalog for the format.
    pub fn import_allowed(
        &self,
        allow_dmabuf: bool,
        catalog: &ModifierCatalog,
        format: &NegotiatedFormat,
    ) -> bool {
        allow_dmabuf && format.modifier.is_some() && !catalog.is_exhausted(format.format)
    }

    pub fn build_buffer_and_meta_params(
        &self,
        import_allowed: bool,
        with_damage: bool,
    ) -> Vec<Param> {
        let stream = &self.config.stream;
        let frame = &self.config.frame;

        let mut data_types = DataTypeMask::default()
            .with(DataKind::MemFd)
            .with(DataKind::MemPtr);
        if import_allowed {
            data_types = data_types.with(DataKind::DmaBuf);
        }

        let mut params = vec![
            Param::Buffers(BufferParams {
                buffers: IntRange::new(
                    stream.default_buffers,
                    stream.min_buffers,
                    stream.max_buffers,
                ),
                align: stream.align,
                data_types,
            }),
            Param::Meta(MetaParam {
                kind: MetaKind::Header,
                size: IntRange::fixed(HEADER_META_SIZE),
            }),
            Param::Meta(MetaParam {
                kind: MetaKind::Cursor,
                size: IntRange::new(
                    cursor_meta_size(frame.cursor_size, frame.cursor_size),
                    cursor_meta_size(1, 1),
                    cursor_meta_size(frame.cursor_max_size, frame.cursor_max_size),
                ),
            }),
        ];

        if with_damage {
            let regions = frame.max_damage_regions;
            params.push(Param::Meta(MetaParam {
                kind: MetaKind::VideoDamage,
                size: IntRange::new(
                    REGION_META_SIZE * regions,
                    REGION_META_SIZE,
                    REGION_META_SIZE * regions,
                ),
            }));
        }
        params
    }
}

fn build_format(format: VideoFormat, modifiers: &[u64], dont_fixate: bool) -> FormatOffer {
    let modifier = match modifiers {
        [] => ModifierProperty::Absent,
        // Implicit layout only: skip the fixation phase entirely.
        [DRM_FORMAT_MOD_INVALID] => ModifierProperty::Implicit(DRM_FORMAT_MOD_INVALID),
        [first, ..] => {
            let mut choices = Vec::with_capacity(modifiers.len() + 1);
            choices.push(*first);
            choices.extend_from_slice(modifiers);
            ModifierProperty::Enumerated {
                choices,
                dont_fixate,
            }
        }
    };

    FormatOffer {
        format,
        min_size: Size::new(1, 1),
        max_size: Size::new(u32::MAX, u32::MAX),
        modifier,
    }
}
