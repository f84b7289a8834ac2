//! Run the full readout path over two emulated equipments for one second.
//!
//! ```bash
//! RUST_LOG=info cargo run --example emulated_readout
//! ```

use std::sync::Arc;
use std::time::Duration;

use readout_core::ReadoutConfig;
use readout_pool::PagePool;
use readout_stream::{
    AggregatorHandle, DataSetAggregator, DmaChannel, EmulatorChannel, EmulatorConfig,
    EquipmentHandle, ReadoutEquipment, StatsConsumer,
};

const CONFIG: &str = r#"
[pool]
pageCount = 256
pageSize = 262144
headerReserve = 4096

[aggregator]
sliceTimeout = 0.5
outputQueueCapacity = 512

[[equipment]]
name = "emu-a"
rdhUseFirstInPageEnabled = true
rdhCheckEnabled = true
outputQueueCapacity = 512

[[equipment]]
name = "emu-b"
rdhUseFirstInPageEnabled = true
rdhCheckEnabled = true
outputQueueCapacity = 512
"#;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ReadoutConfig::from_toml_str(CONFIG)?;
    let pool = PagePool::new(&config.pool)?;

    let mut equipments = Vec::new();
    for (ix, eq_cfg) in config.equipment.iter().enumerate() {
        let channel = DmaChannel::Emulator(EmulatorChannel::new(EmulatorConfig {
            cru_id: ix as u16 + 1,
            link_ids: vec![0, 1],
            orbits_per_page: 64,
            ..Default::default()
        }));
        let equipment = ReadoutEquipment::new(eq_cfg.clone(), channel, pool.clone());
        equipments.push(EquipmentHandle::spawn(equipment, Duration::from_millis(1))?);
    }

    let mut aggregator = DataSetAggregator::new(config.aggregator.clone());
    for handle in &equipments {
        aggregator.add_input(handle.queue());
    }
    let mut aggregator = AggregatorHandle::spawn(aggregator)?;
    let output = aggregator.output_queue();
    let mut stats = StatsConsumer::new(Arc::clone(&output), Duration::from_millis(250))
        .spawn(Duration::from_millis(1))?;

    std::thread::sleep(Duration::from_secs(1));

    // Orderly shutdown: equipments first, then flush and stop the
    // aggregator, then the consumer.
    for handle in &mut equipments {
        handle.stop(true);
    }
    aggregator.flush();
    std::thread::sleep(Duration::from_millis(50));
    aggregator.stop(true);
    stats.stop(true);

    println!(
        "delivered {} data sets, {} pages, {} bytes",
        stats.sets(),
        stats.blocks(),
        stats.bytes()
    );
    Ok(())
}
