//! The timeframe readout data path.
//!
//! Pages flow through the path:
//!
//! ```text
//! DmaChannel ──▶ ReadoutEquipment ──▶ BoundedQueue<PageRef> ─┐
//!                 (one OS thread)                            ├─▶ DataSetAggregator ──▶ BoundedQueue<DataSet> ──▶ consumers
//! DmaChannel ──▶ ReadoutEquipment ──▶ BoundedQueue<PageRef> ─┘     (one OS thread)
//! ```
//!
//! Each equipment producer owns a [`DmaChannel`] (emulator or file replay),
//! refills the driver's transfer queue from the shared page pool, harvests
//! ready pages, tags them with `(equipment, link, timeframe)` and deposits
//! them in its bounded queue. The aggregator fair-merges those queues
//! through one [`TimeframeSlicer`] per input and emits timeframe-complete
//! [`DataSet`]s under bounded output backpressure.

pub mod aggregator;
pub mod driver;
pub mod emulator;
pub mod producer;
pub mod replay;
pub mod slicer;
pub mod stats;

pub use aggregator::{
    AggregatorCounters, AggregatorCounterSnapshot, AggregatorHandle, DataSetAggregator, MAX_LOOP,
};
pub use driver::{DmaChannel, Superpage};
pub use emulator::{EmulatorChannel, EmulatorConfig};
pub use producer::{
    EquipmentCounters, EquipmentCounterSnapshot, EquipmentHandle, EquipmentState,
    ReadoutEquipment,
};
pub use replay::{ReplayChannel, ReplayConfig};
pub use slicer::{DataSet, SliceError, TimeframeSlicer};
pub use stats::{format_bytes, StatsConsumer, StatsHandle};
