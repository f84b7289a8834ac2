//! Page tags and readout constants.
//!
//! Every page travelling through the data path carries a [`PageHeader`]
//! populated by the equipment producer. The slicer groups pages by
//! [`SourceId`], the `(equipment, link)` pair derived from those tags.

use serde::{Deserialize, Serialize};

/// Equipment id sentinel: the producer could not identify the equipment.
pub const UNDEFINED_EQUIPMENT: u16 = 0;

/// Link id sentinel: traffic of the whole equipment collapses into one stream.
pub const UNDEFINED_LINK: u8 = 0xFF;

/// Timeframe id sentinel: the page could not be assigned to a timeframe.
pub const UNDEFINED_TIMEFRAME: u64 = 0;

/// Exclusive upper bound for real link ids.
pub const MAX_LINKS: u8 = 32;

/// LHC orbit rate in Hz (299792458 / 26659).
pub const LHC_ORBIT_RATE: u32 = 11_246;

/// Default timeframe duration in LHC orbits.
pub const DEFAULT_TF_PERIOD_ORBITS: u32 = 256;

/// DMA transfer granularity: the usable region of a page must be a
/// multiple of this.
pub const DMA_ALIGNMENT: usize = 32 * 1024;

/// Tags attached to each page by its equipment producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    /// Number of payload bytes written by the DMA engine.
    pub data_size: u32,
    /// Originating equipment, `UNDEFINED_EQUIPMENT` when unknown.
    pub equipment_id: u16,
    /// Originating link, `UNDEFINED_LINK` when unknown.
    pub link_id: u8,
    /// Timeframe the page belongs to, `UNDEFINED_TIMEFRAME` when unknown.
    pub timeframe_id: u64,
}

impl Default for PageHeader {
    fn default() -> Self {
        Self {
            data_size: 0,
            equipment_id: UNDEFINED_EQUIPMENT,
            link_id: UNDEFINED_LINK,
            timeframe_id: UNDEFINED_TIMEFRAME,
        }
    }
}

/// Identity of a slicing stream.
///
/// Equality defines the stream: pages with equal `SourceId` are grouped by
/// the slicer. A `link_id` of [`UNDEFINED_LINK`] merges all links of an
/// equipment into a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub equipment_id: u16,
    pub link_id: u8,
}

impl SourceId {
    pub fn new(equipment_id: u16, link_id: u8) -> Self {
        Self {
            equipment_id,
            link_id,
        }
    }
}

impl From<&PageHeader> for SourceId {
    fn from(h: &PageHeader) -> Self {
        Self {
            equipment_id: h.equipment_id,
            link_id: h.link_id,
        }
    }
}
