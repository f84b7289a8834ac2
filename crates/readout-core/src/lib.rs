//! Shared foundation for the timeframe readout data path.
//!
//! This crate holds the types every other readout crate builds on:
//!
//! - [`data`]: page tags ([`PageHeader`], [`SourceId`]) and the readout
//!   constants (sentinel ids, link bound, LHC orbit rate).
//! - [`rdh`]: the embedded frame header codec and validator.
//! - [`queue`]: the bounded single-producer/single-consumer FIFO used on
//!   every hop of the data path.
//! - [`time`]: a drift-free interval timer for periodic work inside ticks.
//! - [`worker`]: the cooperative tick loop running on a dedicated OS thread.
//! - [`config`]: TOML configuration for the pool, equipments and aggregator.
//! - [`error`]: the crate-wide error type.

pub mod config;
pub mod data;
pub mod error;
pub mod queue;
pub mod rdh;
pub mod time;
pub mod worker;

pub use config::{AggregatorConfig, EquipmentConfig, PoolConfig, ReadoutConfig};
pub use data::{
    PageHeader, SourceId, DEFAULT_TF_PERIOD_ORBITS, DMA_ALIGNMENT, LHC_ORBIT_RATE, MAX_LINKS,
    UNDEFINED_EQUIPMENT, UNDEFINED_LINK, UNDEFINED_TIMEFRAME,
};
pub use error::{DriverError, DriverErrorKind, ReadoutError, ReadoutResult};
pub use queue::BoundedQueue;
pub use rdh::{RdhError, RdhHeader, RDH_SIZE};
pub use time::IntervalTimer;
pub use worker::{TickResult, WorkerThread};
