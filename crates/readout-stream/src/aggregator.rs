//! Fair-merge aggregator over the per-equipment queues.
//!
//! One worker consumes N bounded input queues, runs one
//! [`TimeframeSlicer`] per input and pushes completed [`DataSet`]s into a
//! single bounded output queue. Service is round-robin with memory: the
//! scan restarts after the last input that produced a slice, so a fast
//! input cannot starve the others. A full output queue makes the tick
//! return `Idle` without dropping anything.
//!
//! `flush()` arms a drain: once an input runs empty, its incomplete slices
//! are emitted too. The flush is complete at the first fully idle tick,
//! which also disarms it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::slicer::{DataSet, TimeframeSlicer};
use readout_core::{
    AggregatorConfig, BoundedQueue, ReadoutError, ReadoutResult, TickResult, WorkerThread,
};
use readout_pool::PageRef;

/// Work bound per input per tick, for both the drain and the pull loop.
pub const MAX_LOOP: usize = 1024;

#[derive(Debug, Default)]
pub struct AggregatorCounters {
    pub blocks_in: AtomicU64,
    pub slices_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorCounterSnapshot {
    pub blocks_in: u64,
    pub slices_out: u64,
    pub output_queue_depth: u64,
}

impl AggregatorCounters {
    pub fn snapshot(&self) -> AggregatorCounterSnapshot {
        AggregatorCounterSnapshot {
            blocks_in: self.blocks_in.load(Ordering::Relaxed),
            slices_out: self.slices_out.load(Ordering::Relaxed),
            output_queue_depth: 0,
        }
    }
}

pub struct DataSetAggregator {
    cfg: AggregatorConfig,
    inputs: Vec<Arc<BoundedQueue<PageRef>>>,
    slicers: Vec<TimeframeSlicer>,
    output: Arc<BoundedQueue<DataSet>>,
    counters: Arc<AggregatorCounters>,
    do_flush: Arc<AtomicBool>,
    next_index: usize,
    epoch: Instant,
}

impl DataSetAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        let output = Arc::new(BoundedQueue::new(cfg.output_queue_capacity));
        Self {
            cfg,
            inputs: Vec::new(),
            slicers: Vec::new(),
            output,
            counters: Arc::new(AggregatorCounters::default()),
            do_flush: Arc::new(AtomicBool::new(false)),
            next_index: 0,
            epoch: Instant::now(),
        }
    }

    /// Register one equipment queue; a dedicated slicer is created for it.
    pub fn add_input(&mut self, queue: Arc<BoundedQueue<PageRef>>) {
        let id = self.slicers.len();
        self.inputs.push(queue);
        self.slicers.push(TimeframeSlicer::new(id));
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_queue(&self) -> Arc<BoundedQueue<DataSet>> {
        Arc::clone(&self.output)
    }

    pub fn counters(&self) -> Arc<AggregatorCounters> {
        Arc::clone(&self.counters)
    }

    pub fn snapshot(&self) -> AggregatorCounterSnapshot {
        let mut s = self.counters.snapshot();
        s.output_queue_depth = self.output.len() as u64;
        s
    }

    /// Shared flag armed by [`AggregatorHandle::flush`].
    pub fn flush_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.do_flush)
    }

    /// Assign stable slicer ids and reset the monotonic clock.
    pub fn start(&mut self) {
        for (ix, slicer) in self.slicers.iter_mut().enumerate() {
            slicer.set_slicer_id(ix);
        }
        self.do_flush.store(false, Ordering::Release);
        self.epoch = Instant::now();
    }

    /// Monotonic seconds since [`start`](Self::start).
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// One scheduling quantum of the merge loop.
    pub fn execute_callback(&mut self) -> TickResult {
        if self.output.is_full() {
            return TickResult::Idle;
        }

        let n_inputs = self.inputs.len();
        let mut blocks_in = 0usize;
        let mut slices_out = 0usize;
        // One timestamp per iteration.
        let now = self.now();

        for ix in 0..n_inputs {
            let i = (ix + self.next_index) % n_inputs;

            if self.cfg.disable_slicing {
                // No slicing: pass pages through one per set.
                if self.output.is_full() {
                    return TickResult::Idle;
                }
                let Some(page) = self.inputs[i].pop() else {
                    continue;
                };
                blocks_in += 1;
                self.counters.blocks_in.fetch_add(1, Ordering::Relaxed);
                let mut set = DataSet::new();
                set.push(page);
                if self.push_output(set).is_err() {
                    return TickResult::Error;
                }
                slices_out += 1;
                continue;
            }

            // Populate slices.
            for _ in 0..MAX_LOOP {
                let Some(page) = self.inputs[i].pop() else {
                    break;
                };
                blocks_in += 1;
                self.counters.blocks_in.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.slicers[i].append_block(page, now) {
                    error!(input = i, error = %e, "slicer rejected a page");
                    return TickResult::Error;
                }
            }

            // Close incomplete slices on timeout.
            if self.cfg.slice_timeout > 0.0 {
                self.slicers[i].complete_on_timeout(now - self.cfg.slice_timeout);
            }

            // Retrieve completed slices.
            for _ in 0..MAX_LOOP {
                if self.output.is_full() {
                    return TickResult::Idle;
                }
                let include_incomplete =
                    self.do_flush.load(Ordering::Acquire) && self.inputs[i].is_empty();
                let Some(set) = self.slicers[i].get_slice(include_incomplete) else {
                    break;
                };
                if self.push_output(set).is_err() {
                    return TickResult::Error;
                }
                slices_out += 1;
                self.next_index = i + 1;
            }
        }

        if blocks_in == 0 && slices_out == 0 {
            // Flushing is complete once we are idle.
            if self.do_flush.load(Ordering::Acquire) {
                self.do_flush.store(false, Ordering::Release);
            }
            return TickResult::Idle;
        }
        TickResult::Ok
    }

    fn push_output(&self, set: DataSet) -> ReadoutResult<()> {
        if self.output.push(set).is_err() {
            // We are the only producer and checked is_full(): a failed
            // push means the queue is shared in error.
            error!("aggregator output queue rejected a set");
            return Err(ReadoutError::InternalInvariant(
                "aggregator output queue rejected a set".into(),
            ));
        }
        self.counters.slices_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Handle to an aggregator running on its own worker thread.
pub struct AggregatorHandle {
    worker: WorkerThread,
    inputs: Vec<Arc<BoundedQueue<PageRef>>>,
    output: Arc<BoundedQueue<DataSet>>,
    counters: Arc<AggregatorCounters>,
    do_flush: Arc<AtomicBool>,
}

impl AggregatorHandle {
    /// Start the merge loop on a dedicated thread.
    pub fn spawn(mut aggregator: DataSetAggregator) -> ReadoutResult<Self> {
        aggregator.start();
        let idle_sleep = Duration::from_millis(aggregator.cfg.idle_sleep_ms.max(1));
        let inputs = aggregator.inputs.clone();
        let output = aggregator.output_queue();
        let counters = aggregator.counters();
        let do_flush = aggregator.flush_flag();
        let worker =
            WorkerThread::spawn("aggregator", idle_sleep, move || {
                aggregator.execute_callback()
            })
            .map_err(ReadoutError::Io)?;
        Ok(Self {
            worker,
            inputs,
            output,
            counters,
            do_flush,
        })
    }

    pub fn output_queue(&self) -> Arc<BoundedQueue<DataSet>> {
        Arc::clone(&self.output)
    }

    pub fn snapshot(&self) -> AggregatorCounterSnapshot {
        let mut s = self.counters.snapshot();
        s.output_queue_depth = self.output.len() as u64;
        s
    }

    /// Arm the drain: incomplete slices of emptied inputs are emitted
    /// until the next fully idle tick.
    pub fn flush(&self) {
        self.do_flush.store(true, Ordering::Release);
    }

    /// True while a flush is armed (it disarms on the first idle tick).
    pub fn flush_pending(&self) -> bool {
        self.do_flush.load(Ordering::Acquire)
    }

    /// Halt the worker, optionally join, then drain all queues.
    pub fn stop(&mut self, wait: bool) {
        self.do_flush.store(false, Ordering::Release);
        self.worker.stop(wait);
        info!(
            blocks_in = self.counters.blocks_in.load(Ordering::Relaxed),
            slices_out = self.counters.slices_out.load(Ordering::Relaxed),
            "aggregator stopped"
        );
        for input in &self.inputs {
            input.clear();
        }
        self.output.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_core::{PageHeader, PoolConfig};
    use readout_pool::{PagePool, PageRef};

    fn pool() -> PagePool {
        PagePool::new(&PoolConfig {
            page_count: 32,
            page_size: 36 * 1024,
            header_reserve: 4096,
            alignment: 4096,
        })
        .unwrap()
    }

    fn page(pool: &PagePool, eq: u16, link: u8, tf: u64) -> PageRef {
        let mut p = pool.acquire().expect("pool page");
        *p.header_mut() = PageHeader {
            data_size: 64,
            equipment_id: eq,
            link_id: link,
            timeframe_id: tf,
        };
        p
    }

    fn one_input(cfg: AggregatorConfig) -> (DataSetAggregator, Arc<BoundedQueue<PageRef>>) {
        let mut agg = DataSetAggregator::new(cfg);
        let input = Arc::new(BoundedQueue::new(64));
        agg.add_input(Arc::clone(&input));
        agg.start();
        (agg, input)
    }

    #[test]
    fn test_boundary_produces_complete_set() {
        let pool = pool();
        let (mut agg, input) = one_input(AggregatorConfig::default());
        let output = agg.output_queue();

        input.push(page(&pool, 0, 0, 7)).unwrap();
        input.push(page(&pool, 0, 0, 7)).unwrap();
        input.push(page(&pool, 0, 0, 8)).unwrap();
        assert_eq!(agg.execute_callback(), TickResult::Ok);

        let set = output.pop().expect("completed set");
        assert_eq!(set.timeframe_id(), 7);
        assert_eq!(set.len(), 2);
        assert!(output.pop().is_none());
    }

    #[test]
    fn test_passthrough_one_page_per_set() {
        let pool = pool();
        let (mut agg, input) = one_input(AggregatorConfig {
            disable_slicing: true,
            ..Default::default()
        });
        let output = agg.output_queue();

        for tf in [1, 1, 2] {
            input.push(page(&pool, 0, 0, tf)).unwrap();
        }
        // Passthrough takes one page per input per tick.
        for _ in 0..3 {
            assert_eq!(agg.execute_callback(), TickResult::Ok);
        }
        assert_eq!(agg.execute_callback(), TickResult::Idle);

        let mut sizes = Vec::new();
        while let Some(set) = output.pop() {
            sizes.push(set.len());
        }
        assert_eq!(sizes, vec![1, 1, 1]);
    }

    #[test]
    fn test_output_backpressure_returns_idle() {
        let pool = pool();
        let (mut agg, input) = one_input(AggregatorConfig {
            output_queue_capacity: 1,
            ..Default::default()
        });
        let output = agg.output_queue();

        for tf in [1, 2, 3] {
            input.push(page(&pool, 0, 0, tf)).unwrap();
        }
        // All three pages drain into the slicer; only one set fits, the
        // tick stalls on the full output.
        assert_eq!(agg.execute_callback(), TickResult::Idle);
        assert_eq!(output.len(), 1);
        assert_eq!(output.pop().unwrap().timeframe_id(), 1);

        // Popping made room for the next completed set.
        assert_eq!(agg.execute_callback(), TickResult::Idle);
        assert_eq!(output.pop().unwrap().timeframe_id(), 2);
    }

    #[test]
    fn test_timeout_closes_stale_slice() {
        let pool = pool();
        let (mut agg, input) = one_input(AggregatorConfig {
            slice_timeout: 0.05,
            ..Default::default()
        });
        let output = agg.output_queue();

        input.push(page(&pool, 0, 0, 7)).unwrap();
        agg.execute_callback();
        assert!(output.is_empty());

        std::thread::sleep(Duration::from_millis(80));
        agg.execute_callback();
        let set = output.pop().expect("timed-out slice");
        assert_eq!(set.timeframe_id(), 7);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_flush_emits_incomplete_and_disarms() {
        let pool = pool();
        let (mut agg, input) = one_input(AggregatorConfig::default());
        let output = agg.output_queue();
        let flush = agg.flush_flag();

        input.push(page(&pool, 0, 0, 3)).unwrap();
        input.push(page(&pool, 0, 0, 3)).unwrap();
        agg.execute_callback();
        assert!(output.is_empty());

        flush.store(true, Ordering::Release);
        assert_eq!(agg.execute_callback(), TickResult::Ok);
        let set = output.pop().expect("flushed set");
        assert_eq!(set.len(), 2);

        // The next idle tick completes the flush.
        assert_eq!(agg.execute_callback(), TickResult::Idle);
        assert!(!flush.load(Ordering::Acquire));
    }

    #[test]
    fn test_round_robin_rotates_between_inputs() {
        let pool = pool();
        let mut agg = DataSetAggregator::new(AggregatorConfig::default());
        let a = Arc::new(BoundedQueue::new(16));
        let b = Arc::new(BoundedQueue::new(16));
        agg.add_input(Arc::clone(&a));
        agg.add_input(Arc::clone(&b));
        agg.start();
        let output = agg.output_queue();

        // Three pages of timeframe 5 per source, then a boundary page.
        for _ in 0..3 {
            a.push(page(&pool, 0, 0, 5)).unwrap();
            b.push(page(&pool, 1, 0, 5)).unwrap();
        }
        a.push(page(&pool, 0, 0, 6)).unwrap();
        b.push(page(&pool, 1, 0, 6)).unwrap();
        while agg.execute_callback() == TickResult::Ok {}

        let first = output.pop().expect("first set");
        let second = output.pop().expect("second set");
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        let mut eqs = [
            first.source().unwrap().equipment_id,
            second.source().unwrap().equipment_id,
        ];
        eqs.sort_unstable();
        assert_eq!(eqs, [0, 1]);
    }

    #[test]
    fn test_stop_drains_everything() {
        let pool = pool();
        let mut agg = DataSetAggregator::new(AggregatorConfig::default());
        let input = Arc::new(BoundedQueue::new(16));
        agg.add_input(Arc::clone(&input));

        input.push(page(&pool, 0, 0, 1)).unwrap();
        input.push(page(&pool, 0, 0, 1)).unwrap();
        let mut handle = AggregatorHandle::spawn(agg).unwrap();
        handle.flush();
        let output = handle.output_queue();
        while output.is_empty() {
            std::thread::yield_now();
        }
        handle.stop(true);

        assert!(input.is_empty());
        assert!(output.is_empty());
        assert_eq!(pool.available(), 32);
    }
}
