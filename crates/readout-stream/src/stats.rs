//! Statistics consumer for the aggregated output stream.
//!
//! Drains the aggregator's output queue on its own worker, accumulating
//! block and byte totals. A periodic summary goes to the log; a final one
//! with averages and rates is written when the consumer stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::slicer::DataSet;
use readout_core::{
    BoundedQueue, IntervalTimer, ReadoutError, ReadoutResult, TickResult, WorkerThread,
};

/// Sets consumed per tick at most, like the other workers' loop bounds.
const MAX_SETS_PER_TICK: usize = 1024;

/// Format a value as a 1024-based (or `base`) prefixed quantity,
/// e.g. `format_bytes(2.5e6, "B/s", 1024.0)` → `"2.384 MB/s"`.
pub fn format_bytes(value: f64, suffix: &str, base: f64) -> String {
    const PREFIXES: [&str; 6] = ["", "k", "M", "G", "T", "P"];
    if value <= 0.0 || !value.is_finite() {
        return format!("0.000 {}", suffix);
    }
    let index = (value.log(base).floor() as usize).min(PREFIXES.len() - 1);
    let scaled = value / base.powi(index as i32);
    format!("{:.3} {}{}", scaled, PREFIXES[index], suffix)
}

#[derive(Debug, Default)]
struct StatsTotals {
    sets: AtomicU64,
    blocks: AtomicU64,
    bytes: AtomicU64,
}

pub struct StatsConsumer {
    input: Arc<BoundedQueue<DataSet>>,
    totals: Arc<StatsTotals>,
    started: Instant,
    report_timer: Option<IntervalTimer>,
}

impl StatsConsumer {
    /// `report_period` of zero disables the periodic summary; the final
    /// summary at stop is always written.
    pub fn new(input: Arc<BoundedQueue<DataSet>>, report_period: Duration) -> Self {
        Self {
            input,
            totals: Arc::new(StatsTotals::default()),
            started: Instant::now(),
            report_timer: (!report_period.is_zero()).then(|| IntervalTimer::new(report_period)),
        }
    }

    pub fn sets(&self) -> u64 {
        self.totals.sets.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> u64 {
        self.totals.blocks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.totals.bytes.load(Ordering::Relaxed)
    }

    pub fn tick(&mut self) -> TickResult {
        let mut consumed = 0usize;
        while consumed < MAX_SETS_PER_TICK {
            let Some(set) = self.input.pop() else {
                break;
            };
            self.totals.sets.fetch_add(1, Ordering::Relaxed);
            self.totals
                .blocks
                .fetch_add(set.len() as u64, Ordering::Relaxed);
            self.totals
                .bytes
                .fetch_add(set.total_bytes(), Ordering::Relaxed);
            consumed += 1;
            // Pages return to the pool here.
            drop(set);
        }
        if let Some(timer) = self.report_timer.as_mut() {
            if timer.is_timeout() {
                timer.increment();
                info!(
                    sets = self.totals.sets.load(Ordering::Relaxed),
                    blocks = self.totals.blocks.load(Ordering::Relaxed),
                    bytes = self.totals.bytes.load(Ordering::Relaxed),
                    "readout stats"
                );
            }
        }
        if consumed == 0 {
            TickResult::Idle
        } else {
            TickResult::Ok
        }
    }

    /// Move the consumer onto its own thread.
    pub fn spawn(self, idle_sleep: Duration) -> ReadoutResult<StatsHandle> {
        let totals = Arc::clone(&self.totals);
        let mut consumer = self;
        let worker = WorkerThread::spawn("stats-consumer", idle_sleep, move || consumer.tick())
            .map_err(ReadoutError::Io)?;
        Ok(StatsHandle { worker, totals })
    }
}

impl Drop for StatsConsumer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let blocks = self.totals.blocks.load(Ordering::Relaxed);
        let bytes = self.totals.bytes.load(Ordering::Relaxed);
        if blocks == 0 {
            info!("stats: no data received");
            return;
        }
        info!(
            sets = self.totals.sets.load(Ordering::Relaxed),
            blocks,
            bytes,
            avg_block_size = bytes / blocks,
            block_rate = %format_bytes(blocks as f64 / elapsed, "Hz", 1000.0),
            throughput = %format_bytes(bytes as f64 / elapsed, "B/s", 1024.0),
            elapsed_s = elapsed,
            "stats: final summary"
        );
    }
}

/// Handle to a stats consumer running on its own thread.
pub struct StatsHandle {
    worker: WorkerThread,
    totals: Arc<StatsTotals>,
}

impl StatsHandle {
    pub fn sets(&self) -> u64 {
        self.totals.sets.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> u64 {
        self.totals.blocks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.totals.bytes.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self, wait: bool) {
        self.worker.stop(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_core::{PageHeader, PoolConfig};
    use readout_pool::PagePool;

    fn pool() -> PagePool {
        PagePool::new(&PoolConfig {
            page_count: 8,
            page_size: 36 * 1024,
            header_reserve: 4096,
            alignment: 4096,
        })
        .unwrap()
    }

    fn set_of(pool: &PagePool, pages: usize, bytes_each: u32) -> DataSet {
        let mut set = DataSet::new();
        for _ in 0..pages {
            let mut p = pool.acquire().unwrap();
            *p.header_mut() = PageHeader {
                data_size: bytes_each,
                ..Default::default()
            };
            set.push(p);
        }
        set
    }

    #[test]
    fn test_totals_accumulate() {
        let pool = pool();
        let queue = Arc::new(BoundedQueue::new(8));
        let mut consumer = StatsConsumer::new(Arc::clone(&queue), Duration::ZERO);

        queue.push(set_of(&pool, 2, 100)).unwrap();
        queue.push(set_of(&pool, 3, 10)).unwrap();
        assert_eq!(consumer.tick(), TickResult::Ok);
        assert_eq!(consumer.tick(), TickResult::Idle);

        assert_eq!(consumer.sets(), 2);
        assert_eq!(consumer.blocks(), 5);
        assert_eq!(consumer.bytes(), 230);
        // Consumed pages went back to the pool.
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512.0, "B/s", 1024.0), "512.000 B/s");
        assert_eq!(format_bytes(2048.0, "B/s", 1024.0), "2.000 kB/s");
        assert_eq!(format_bytes(3_000_000.0, "Hz", 1000.0), "3.000 MHz");
        assert_eq!(format_bytes(0.0, "B", 1024.0), "0.000 B");
    }

    #[test]
    fn test_spawned_consumer_drains_queue() {
        let pool = pool();
        let queue = Arc::new(BoundedQueue::new(8));
        let consumer = StatsConsumer::new(Arc::clone(&queue), Duration::ZERO);
        let mut handle = consumer.spawn(Duration::from_millis(1)).unwrap();

        for _ in 0..4 {
            queue.push(set_of(&pool, 1, 50)).unwrap();
        }
        while handle.sets() < 4 {
            std::thread::yield_now();
        }
        handle.stop(true);
        assert_eq!(handle.blocks(), 4);
        assert_eq!(pool.available(), 8);
    }
}
