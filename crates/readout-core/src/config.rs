//! TOML configuration for the readout data path.
//!
//! Keys follow the historical readout naming (camelCase, `TFperiod`), so
//! operator configurations stay stable across the data-path rewrite:
//!
//! ```toml
//! [pool]
//! pageCount = 128
//! pageSize = 1048576
//!
//! [aggregator]
//! sliceTimeout = 1.0
//!
//! [[equipment]]
//! name = "emu-0"
//! rdhUseFirstInPageEnabled = true
//! rdhCheckEnabled = true
//! ```
//!
//! Parsing is plain serde + TOML; [`ReadoutConfig::validate`] applies the
//! semantic rules parsing cannot express and turns violations into
//! [`ReadoutError::Config`] before anything is allocated or started.

use crate::data::{DEFAULT_TF_PERIOD_ORBITS, DMA_ALIGNMENT};
use crate::error::{ReadoutError, ReadoutResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_page_count() -> usize {
    64
}

fn default_page_size() -> usize {
    1024 * 1024
}

fn default_header_reserve() -> usize {
    4096
}

fn default_alignment() -> usize {
    4096
}

fn default_queue_capacity() -> usize {
    256
}

fn default_tf_period() -> u32 {
    DEFAULT_TF_PERIOD_ORBITS
}

fn default_idle_sleep_ms() -> u64 {
    1
}

fn default_equipment_name() -> String {
    "equipment".to_string()
}

/// Geometry of the shared DMA page pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of pages carved from the contiguous block.
    #[serde(default = "default_page_count")]
    pub page_count: usize,

    /// Size of one page in bytes, header reserve included.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Bytes reserved at the start of each page, excluded from DMA.
    #[serde(default = "default_header_reserve")]
    pub header_reserve: usize,

    /// Alignment of the registered block (must be a power of two).
    #[serde(default = "default_alignment")]
    pub alignment: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_count: default_page_count(),
            page_size: default_page_size(),
            header_reserve: default_header_reserve(),
            alignment: default_alignment(),
        }
    }
}

impl PoolConfig {
    /// Usable DMA bytes per page: the payload region rounded down to the
    /// hardware transfer granularity. Zero means the geometry is invalid.
    pub fn usable_page_size(&self) -> usize {
        let payload = self.page_size.saturating_sub(self.header_reserve);
        payload - payload % DMA_ALIGNMENT
    }

    pub fn validate(&self) -> ReadoutResult<()> {
        if self.page_count == 0 {
            return Err(ReadoutError::Config("pool pageCount must be > 0".into()));
        }
        if !self.alignment.is_power_of_two() {
            return Err(ReadoutError::Config(format!(
                "pool alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.usable_page_size() == 0 {
            return Err(ReadoutError::Config(format!(
                "usable page size is zero: pageSize {} minus headerReserve {} \
                 leaves no {} byte DMA multiple",
                self.page_size, self.header_reserve, DMA_ALIGNMENT
            )));
        }
        Ok(())
    }
}

/// Per-equipment producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EquipmentConfig {
    /// Name used in logs and thread names.
    #[serde(default = "default_equipment_name")]
    pub name: String,

    /// Parse and validate every embedded frame header of each page.
    #[serde(default)]
    pub rdh_check_enabled: bool,

    /// Use the first embedded frame header to tag pages (equipment, link,
    /// timeframe from the heartbeat orbit). Off = software timeframe clock.
    #[serde(default)]
    pub rdh_use_first_in_page_enabled: bool,

    /// Check that the per-link packet counter increments by one mod 256.
    #[serde(default = "default_true")]
    pub rdh_check_packet_counter_contiguous: bool,

    /// Log a frame-header summary for each harvested page. Negative =
    /// only the first |n| pages, positive = unlimited, 0 = off.
    #[serde(default)]
    pub rdh_dump_enabled: i32,

    /// Log a message for each frame-header error found.
    #[serde(default = "default_true")]
    pub rdh_dump_error_enabled: bool,

    /// Zero the page payload before handing it to the DMA engine. Slow.
    #[serde(default)]
    pub clean_page_before_use: bool,

    /// Timeframe duration in LHC orbits.
    #[serde(default = "default_tf_period", rename = "TFperiod")]
    pub tf_period: u32,

    /// Escalate driver-reported packet drops to a fatal tick result.
    #[serde(default)]
    pub stop_on_error: bool,

    /// Capacity of this equipment's output queue.
    #[serde(default = "default_queue_capacity")]
    pub output_queue_capacity: usize,
}

impl Default for EquipmentConfig {
    fn default() -> Self {
        Self {
            name: default_equipment_name(),
            rdh_check_enabled: false,
            rdh_use_first_in_page_enabled: false,
            rdh_check_packet_counter_contiguous: true,
            rdh_dump_enabled: 0,
            rdh_dump_error_enabled: true,
            clean_page_before_use: false,
            tf_period: default_tf_period(),
            stop_on_error: false,
            output_queue_capacity: default_queue_capacity(),
        }
    }
}

impl EquipmentConfig {
    pub fn validate(&self) -> ReadoutResult<()> {
        if self.tf_period == 0 {
            return Err(ReadoutError::Config(format!(
                "equipment {}: TFperiod must be > 0",
                self.name
            )));
        }
        if self.output_queue_capacity == 0 {
            return Err(ReadoutError::Config(format!(
                "equipment {}: outputQueueCapacity must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Pass pages through one-per-DataSet instead of slicing by timeframe.
    #[serde(default)]
    pub disable_slicing: bool,

    /// Close open slices untouched for this many seconds. 0 = disabled.
    #[serde(default)]
    pub slice_timeout: f64,

    /// Capacity of the aggregated output queue.
    #[serde(default = "default_queue_capacity")]
    pub output_queue_capacity: usize,

    /// Inter-tick sleep quantum for the worker threads, in milliseconds.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            disable_slicing: false,
            slice_timeout: 0.0,
            output_queue_capacity: default_queue_capacity(),
            idle_sleep_ms: default_idle_sleep_ms(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> ReadoutResult<()> {
        if self.slice_timeout < 0.0 {
            return Err(ReadoutError::Config(
                "aggregator sliceTimeout must be >= 0".into(),
            ));
        }
        if self.output_queue_capacity == 0 {
            return Err(ReadoutError::Config(
                "aggregator outputQueueCapacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration: one pool, one aggregator, N equipments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadoutConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub equipment: Vec<EquipmentConfig>,
}

impl ReadoutConfig {
    pub fn from_toml_str(text: &str) -> ReadoutResult<Self> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ReadoutResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ReadoutResult<()> {
        self.pool.validate()?;
        self.aggregator.validate()?;
        for eq in &self.equipment {
            eq.validate()?;
        }
        Ok(())
    }
}
