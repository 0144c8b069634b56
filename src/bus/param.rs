//! Parameter objects exchanged with the bus during negotiation

use crate::capture::format::VideoFormat;

use super::buffer::DataKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Integer choice: a preferred value within `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

impl IntRange {
    pub const fn new(default: u32, min: u32, max: u32) -> Self {
        Self { default, min, max }
    }

    pub const fn fixed(value: u32) -> Self {
        Self::new(value, value, value)
    }

    pub fn contains(&self, value: u32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Modifier property of a format offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifierProperty {
    /// No constraint: plain shared-memory path.
    Absent,
    /// Mandatory single value, the implicit-layout sentinel.
    Implicit(u64),
    /// Mandatory enumerated set. `choices` starts with the preferred value.
    Enumerated { choices: Vec<u64>, dont_fixate: bool },
}

impl ModifierProperty {
    pub fn is_absent(&self) -> bool {
        matches!(self, ModifierProperty::Absent)
    }

    /// Distinct candidate modifiers, in preference order.
    pub fn modifiers(&self) -> Vec<u64> {
        match self {
            ModifierProperty::Absent => Vec::new(),
            ModifierProperty::Implicit(m) => vec![*m],
            ModifierProperty::Enumerated { choices, .. } => {
                let mut out: Vec<u64> = Vec::with_capacity(choices.len());
                for m in choices {
                    if !out.contains(m) {
                        out.push(*m);
                    }
                }
                out
            }
        }
    }
}

/// One candidate video format offered to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOffer {
    pub format: VideoFormat,
    pub min_size: Size,
    pub max_size: Size,
    pub modifier: ModifierProperty,
}

/// Bitmask of acceptable buffer transports, one bit per [`DataKind`] id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataTypeMask(pub u32);

impl DataTypeMask {
    fn bit(kind: DataKind) -> u32 {
        1u32.checked_shl(kind.id()).unwrap_or(0)
    }

    pub fn with(self, kind: DataKind) -> Self {
        Self(self.0 | Self::bit(kind))
    }

    pub fn contains(&self, kind: DataKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferParams {
    pub buffers: IntRange,
    pub align: u32,
    pub data_types: DataTypeMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Header,
    Cursor,
    VideoDamage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaParam {
    pub kind: MetaKind,
    /// Size in bytes of the meta area.
    pub size: IntRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    EnumFormat(FormatOffer),
    Buffers(BufferParams),
    Meta(MetaParam),
}

/// The concrete format the bus settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub format: VideoFormat,
    pub size: Size,
    /// Present when the fixed format carries the modifier property,
    /// i.e. the peer can hand out DMA-BUFs.
    pub modifier: Option<u64>,
    pub framerate: (u32, u32),
    pub max_framerate: (u32, u32),
}

impl NegotiatedFormat {
    pub fn new(format: VideoFormat, size: Size) -> Self {
        Self {
            format,
            size,
            modifier: None,
            framerate: (0, 1),
            max_framerate: (0, 1),
        }
    }

    pub fn with_modifier(mut self, modifier: u64) -> Self {
        self.modifier = Some(modifier);
        self
    }
}
