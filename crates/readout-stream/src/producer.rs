//! Equipment producer: owns one DMA channel and feeds the data path.
//!
//! One producer runs per physical input channel, on its own OS thread.
//! Each scheduling quantum ([`ReadoutEquipment::tick`]) performs, in order:
//!
//! 1. **Drop monitor** — at most once per second, read the driver's
//!    cumulative dropped-packet counter; a positive delta is counted,
//!    warned about and, with `stopOnError`, escalated to a fatal tick
//!    result after the quantum completes.
//! 2. **Refill** — hand free pool pages to the driver while its transfer
//!    queue has room, optionally zeroing them first.
//! 3. **Harvest** — pop completed superpages, check page validity, tag
//!    each page with `(equipment, link, timeframe)` and deposit it in the
//!    bounded output queue. A full queue stalls the harvest; nothing is
//!    dropped.
//! 4. Report `Idle` when the quantum pushed less than a quarter of the
//!    driver queue depth and harvested nothing.
//!
//! Timeframe ids come either from the first embedded frame header of each
//! page (heartbeat-orbit arithmetic) or from a software clock ticking at
//! `LHC_ORBIT_RATE / TFperiod` Hz.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::driver::{DmaChannel, Superpage};
use readout_core::rdh::hex_dump;
use readout_core::{
    BoundedQueue, EquipmentConfig, IntervalTimer, PageHeader, RdhHeader, ReadoutError,
    ReadoutResult, TickResult, WorkerThread, LHC_ORBIT_RATE, MAX_LINKS, UNDEFINED_EQUIPMENT,
    UNDEFINED_LINK,
};
use readout_pool::{PagePool, PageRef};

/// Producer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquipmentState {
    /// Driver open failed; the producer is unusable.
    Uninit,
    /// Driver open, DMA not running.
    Initialized,
    /// DMA running, ticks make progress.
    Running,
    /// Stop requested, draining driver-owned pages.
    Stopping,
    /// Torn down.
    Stopped,
}

/// Observable per-equipment counters. Relaxed atomics: written by the
/// producer thread, read by anyone.
#[derive(Debug, Default)]
pub struct EquipmentCounters {
    pub pages_in: AtomicU64,
    pub pages_empty: AtomicU64,
    pub pages_lost: AtomicU64,
    pub timeframes: AtomicU64,
    pub rdh_ok: AtomicU64,
    pub rdh_err: AtomicU64,
    pub rdh_stream_err: AtomicU64,
    pub dropped_by_driver: AtomicU64,
    pub memory_low: AtomicU64,
    pub push_blocked_idle: AtomicU64,
}

/// Point-in-time copy of [`EquipmentCounters`] for publication.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentCounterSnapshot {
    pub pages_in: u64,
    pub pages_empty: u64,
    pub pages_lost: u64,
    pub timeframes: u64,
    pub rdh_ok: u64,
    pub rdh_err: u64,
    pub rdh_stream_err: u64,
    pub dropped_by_driver: u64,
    pub memory_low: u64,
    pub push_blocked_idle: u64,
    pub output_queue_depth: u64,
}

impl EquipmentCounters {
    pub fn snapshot(&self) -> EquipmentCounterSnapshot {
        EquipmentCounterSnapshot {
            pages_in: self.pages_in.load(Ordering::Relaxed),
            pages_empty: self.pages_empty.load(Ordering::Relaxed),
            pages_lost: self.pages_lost.load(Ordering::Relaxed),
            timeframes: self.timeframes.load(Ordering::Relaxed),
            rdh_ok: self.rdh_ok.load(Ordering::Relaxed),
            rdh_err: self.rdh_err.load(Ordering::Relaxed),
            rdh_stream_err: self.rdh_stream_err.load(Ordering::Relaxed),
            dropped_by_driver: self.dropped_by_driver.load(Ordering::Relaxed),
            memory_low: self.memory_low.load(Ordering::Relaxed),
            push_blocked_idle: self.push_blocked_idle.load(Ordering::Relaxed),
            output_queue_depth: 0,
        }
    }

    fn reset(&self) {
        self.pages_in.store(0, Ordering::Relaxed);
        self.pages_empty.store(0, Ordering::Relaxed);
        self.pages_lost.store(0, Ordering::Relaxed);
        self.timeframes.store(0, Ordering::Relaxed);
        self.rdh_ok.store(0, Ordering::Relaxed);
        self.rdh_err.store(0, Ordering::Relaxed);
        self.rdh_stream_err.store(0, Ordering::Relaxed);
        self.dropped_by_driver.store(0, Ordering::Relaxed);
        self.memory_low.store(0, Ordering::Relaxed);
        self.push_blocked_idle.store(0, Ordering::Relaxed);
    }
}

pub struct ReadoutEquipment {
    cfg: EquipmentConfig,
    channel: DmaChannel,
    pool: PagePool,
    output: Arc<BoundedQueue<PageRef>>,
    counters: Arc<EquipmentCounters>,
    state: EquipmentState,

    /// Driver transfer-queue depth captured at start (0 treated as 1).
    fifo_depth: usize,
    waiting_first_loop: bool,
    drop_timer: IntervalTimer,
    last_dropped: i32,

    /// Software timeframe clock; `None` when ids come from frame headers.
    tf_clock: Option<IntervalTimer>,
    current_tf: u64,
    /// True once the first valid frame header anchored the orbit window.
    orbit_tracking: bool,
    first_tf_orbit: u32,
    tf_orbit_begin: u32,
    last_packet_counter: [u8; MAX_LINKS as usize],
    dump_budget: i32,
}

impl ReadoutEquipment {
    /// Wrap an opened DMA channel. The producer starts `Initialized`;
    /// a channel that failed to open never reaches this point.
    pub fn new(cfg: EquipmentConfig, channel: DmaChannel, pool: PagePool) -> Self {
        let output = Arc::new(BoundedQueue::new(cfg.output_queue_capacity));
        if cfg.clean_page_before_use {
            info!(
                equipment = %cfg.name,
                "pages will be zeroed before each DMA - this may be slow"
            );
        }
        let using_software_clock = !cfg.rdh_use_first_in_page_enabled;
        if using_software_clock {
            let rate = LHC_ORBIT_RATE as f64 / cfg.tf_period as f64;
            info!(
                equipment = %cfg.name,
                tf_period_orbits = cfg.tf_period,
                rate_hz = rate,
                "timeframe ids generated by software clock"
            );
        } else {
            info!(
                equipment = %cfg.name,
                tf_period_orbits = cfg.tf_period,
                "timeframe ids generated from frame header orbit counters"
            );
        }
        Self {
            channel,
            pool,
            output,
            counters: Arc::new(EquipmentCounters::default()),
            state: EquipmentState::Initialized,
            fifo_depth: 1,
            waiting_first_loop: true,
            drop_timer: IntervalTimer::new(Duration::from_secs(1)),
            last_dropped: 0,
            tf_clock: None,
            current_tf: 0,
            orbit_tracking: false,
            first_tf_orbit: 0,
            tf_orbit_begin: 0,
            last_packet_counter: [0; MAX_LINKS as usize],
            dump_budget: 0,
            cfg,
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn state(&self) -> EquipmentState {
        self.state
    }

    pub fn counters(&self) -> Arc<EquipmentCounters> {
        Arc::clone(&self.counters)
    }

    /// The queue this producer deposits tagged pages into.
    pub fn output_queue(&self) -> Arc<BoundedQueue<PageRef>> {
        Arc::clone(&self.output)
    }

    pub fn snapshot(&self) -> EquipmentCounterSnapshot {
        let mut s = self.counters.snapshot();
        s.output_queue_depth = self.output.len() as u64;
        s
    }

    /// Enable DMA and reset per-run state.
    pub fn start(&mut self) -> ReadoutResult<()> {
        match self.state {
            EquipmentState::Initialized => {}
            EquipmentState::Uninit => {
                return Err(ReadoutError::InternalInvariant(format!(
                    "equipment {}: start on uninitialized producer",
                    self.cfg.name
                )))
            }
            _ => {
                return Err(ReadoutError::InternalInvariant(format!(
                    "equipment {}: start in state {:?}",
                    self.cfg.name, self.state
                )))
            }
        }

        self.counters.reset();
        self.current_tf = 0;
        self.orbit_tracking = false;
        self.first_tf_orbit = 0;
        self.tf_orbit_begin = 0;
        self.last_packet_counter = [0; MAX_LINKS as usize];
        self.dump_budget = self.cfg.rdh_dump_enabled;
        self.waiting_first_loop = true;
        self.last_dropped = 0;
        self.tf_clock = if self.cfg.rdh_use_first_in_page_enabled {
            None
        } else {
            let period = self.cfg.tf_period as f64 / LHC_ORBIT_RATE as f64;
            Some(IntervalTimer::new(Duration::from_secs_f64(period)))
        };

        self.channel.start_dma()?;
        self.fifo_depth = self.channel.transfer_queue_available().max(1);
        info!(
            equipment = %self.cfg.name,
            kind = self.channel.kind(),
            fifo_depth = self.fifo_depth,
            "DMA started"
        );
        self.state = EquipmentState::Running;
        Ok(())
    }

    /// Disable DMA and release every page the driver still owns.
    ///
    /// The channel is stopped before any page is released, so the DMA
    /// engine can no longer write to them. Returns to `Initialized`.
    pub fn stop(&mut self) {
        if !matches!(
            self.state,
            EquipmentState::Running | EquipmentState::Stopping
        ) {
            return;
        }
        self.state = EquipmentState::Stopping;
        if let Err(e) = self.channel.stop_dma() {
            error!(equipment = %self.cfg.name, error = %e, "DMA stop failed");
        }
        while let Some(sp) = self.channel.pop_superpage() {
            drop(sp); // page returns to the pool
        }
        self.log_final_counters();
        self.state = EquipmentState::Initialized;
    }

    /// One non-blocking scheduling quantum.
    pub fn tick(&mut self) -> TickResult {
        match self.state {
            EquipmentState::Running => {}
            EquipmentState::Uninit => return TickResult::Error,
            _ => return TickResult::Idle,
        }

        // Phase 1: drop monitor, at most once per second.
        let mut fatal = false;
        if self.waiting_first_loop || self.drop_timer.is_timeout() {
            let current = self.channel.dropped_packets();
            if !self.waiting_first_loop {
                let delta = current - self.last_dropped;
                if delta > 0 {
                    self.counters
                        .dropped_by_driver
                        .fetch_add(delta as u64, Ordering::Relaxed);
                    warn!(
                        equipment = %self.cfg.name,
                        new = delta,
                        total = current,
                        "DMA engine dropped packets"
                    );
                    if self.cfg.stop_on_error {
                        fatal = true;
                    }
                }
            }
            self.last_dropped = current;
            if self.waiting_first_loop {
                self.drop_timer.reset(Duration::from_secs(1));
            } else {
                self.drop_timer.increment();
            }
            self.waiting_first_loop = false;
        }

        // Phase 2: refill the driver transfer queue from the pool.
        let mut pushed = 0usize;
        while self.channel.transfer_queue_available() > 0 {
            let Some(mut page) = self.pool.acquire() else {
                self.counters.memory_low.fetch_add(1, Ordering::Relaxed);
                break;
            };
            if self.cfg.clean_page_before_use {
                page.zero_payload();
            }
            match self.channel.push_superpage(Superpage::new(page)) {
                Ok(()) => pushed += 1,
                Err(refused) => {
                    // Typically DMA was stopped meanwhile; the page goes
                    // back to the pool.
                    drop(refused);
                    break;
                }
            }
        }
        self.channel.fill_superpages();

        // Phase 3: harvest completed superpages.
        let mut harvested = 0usize;
        while self.channel.ready_queue_size() > 0 {
            if self.output.is_full() {
                self.counters
                    .push_blocked_idle
                    .fetch_add(1, Ordering::Relaxed);
                break;
            }
            let Some(sp) = self.channel.pop_superpage() else {
                break;
            };
            let Superpage {
                mut page,
                received,
                ready,
            } = sp;
            if !self.pool.is_valid(&page) {
                warn!(
                    equipment = %self.cfg.name,
                    slot = page.index(),
                    "invalid page from driver"
                );
                self.counters.pages_lost.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !ready {
                // Leftover of a stopped transfer: release silently.
                self.counters.pages_empty.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.decorate(&mut page, received);
            if self.cfg.rdh_dump_enabled != 0 {
                self.dump_page(&page);
            }
            if self.cfg.rdh_check_enabled {
                self.scan_page(&page);
            }
            if self.output.push(page).is_err() {
                // Single producer and is_full() held above; unreachable
                // unless the queue is shared in error.
                error!(equipment = %self.cfg.name, "output queue rejected a page");
                self.counters.pages_lost.fetch_add(1, Ordering::Relaxed);
                return TickResult::Error;
            }
            harvested += 1;
        }

        if fatal {
            error!(equipment = %self.cfg.name, "data has been lost, stopping on error");
            return TickResult::Error;
        }
        // Less than a quarter of the driver queue refilled (and at least
        // one page for shallow queues) plus an empty harvest: no progress.
        if harvested == 0 && pushed < (self.fifo_depth / 4).max(1) {
            TickResult::Idle
        } else {
            TickResult::Ok
        }
    }

    /// Tag a harvested page with equipment, link and timeframe.
    fn decorate(&mut self, page: &mut PageRef, received: u32) {
        if let Some(clock) = self.tf_clock.as_mut() {
            if clock.is_timeout() {
                self.current_tf += 1;
                self.counters.timeframes.fetch_add(1, Ordering::Relaxed);
                clock.increment();
            }
        }
        self.counters.pages_in.fetch_add(1, Ordering::Relaxed);

        let mut header = PageHeader {
            data_size: received,
            ..PageHeader::default()
        };
        if self.cfg.rdh_use_first_in_page_enabled {
            let payload = page.payload();
            let len = (received as usize).min(payload.len());
            match RdhHeader::decode(&payload[..len]).map(|h| (h, h.validate())) {
                Some((h, Ok(()))) => {
                    // A hardware id of 0 is the card default, not a real id.
                    header.equipment_id = if h.cru_id == 0 {
                        UNDEFINED_EQUIPMENT
                    } else {
                        h.cru_id
                    };
                    header.link_id = h.link_id;
                    self.update_timeframe(h.hb_orbit);
                }
                Some((_, Err(e))) => {
                    warn!(
                        equipment = %self.cfg.name,
                        error = %e,
                        "first frame header in page is invalid"
                    );
                }
                None => {
                    warn!(
                        equipment = %self.cfg.name,
                        received,
                        "page too short for a frame header"
                    );
                }
            }
        }
        header.timeframe_id = self.current_tf;
        *page.header_mut() = header;
    }

    /// Advance the timeframe id from a heartbeat orbit.
    ///
    /// The timeframe window stays periodic and aligned to the orbit of the
    /// first page; a skipped window is accepted with a warning.
    fn update_timeframe(&mut self, hb_orbit: u32) {
        let period = self.cfg.tf_period;
        if self.orbit_tracking
            && (hb_orbit as u64) < self.tf_orbit_begin as u64 + period as u64
        {
            return;
        }
        if !self.orbit_tracking {
            self.first_tf_orbit = hb_orbit;
            self.orbit_tracking = true;
        }
        self.counters.timeframes.fetch_add(1, Ordering::Relaxed);
        self.tf_orbit_begin = hb_orbit - (hb_orbit - self.first_tf_orbit) % period;
        let new_tf = 1 + ((self.tf_orbit_begin - self.first_tf_orbit) / period) as u64;
        if new_tf != self.current_tf + 1 && self.cfg.rdh_dump_error_enabled {
            warn!(
                equipment = %self.cfg.name,
                previous = self.current_tf,
                new = new_tf,
                "non-contiguous timeframe ids"
            );
        }
        self.current_tf = new_tf;
    }

    /// Log a summary of the page's whole frame-header chain.
    ///
    /// The dump budget is spent per page, not per header: a negative
    /// `rdhDumpEnabled` dumps exactly the first |n| pages and then stops.
    fn dump_page(&mut self, page: &PageRef) {
        if self.dump_budget == 0 {
            return;
        }
        if self.dump_budget < 0 {
            self.dump_budget += 1;
        }
        let data = page.data();
        let mut offset = 0usize;
        while offset < data.len() {
            let Some(h) = RdhHeader::decode(&data[offset..]) else {
                break;
            };
            debug!(
                equipment = %self.cfg.name,
                offset,
                version = h.version,
                link = h.link_id,
                packet = h.packet_counter,
                orbit = h.hb_orbit,
                next = h.offset_next_packet,
                "frame header"
            );
            if h.offset_next_packet == 0 {
                break;
            }
            offset += h.offset_next_packet as usize;
        }
    }

    /// Walk and validate every embedded frame header of a page.
    ///
    /// Errors update counters and stop the scan; the page itself is kept.
    fn scan_page(&mut self, page: &PageRef) {
        let data = page.data();
        let mut offset = 0usize;
        let mut page_link: Option<u8> = None;
        let mut index = 0u32;
        while offset < data.len() {
            let Some(h) = RdhHeader::decode(&data[offset..]) else {
                break; // end of valid data
            };
            index += 1;
            if let Err(e) = h.validate() {
                self.counters.rdh_err.fetch_add(1, Ordering::Relaxed);
                if self.cfg.rdh_dump_error_enabled {
                    warn!(
                        equipment = %self.cfg.name,
                        header = index,
                        offset,
                        error = %e,
                        dump = %hex_dump(&data[offset..], 64),
                        "frame header check failed"
                    );
                }
                break;
            }
            self.counters.rdh_ok.fetch_add(1, Ordering::Relaxed);

            // The link id must be constant throughout a page.
            match page_link {
                None => page_link = Some(h.link_id),
                Some(l) if l != h.link_id => {
                    self.counters.rdh_stream_err.fetch_add(1, Ordering::Relaxed);
                    if self.cfg.rdh_dump_error_enabled {
                        warn!(
                            equipment = %self.cfg.name,
                            header = index,
                            offset,
                            expected = l,
                            found = h.link_id,
                            "inconsistent link ids in page"
                        );
                    }
                    break;
                }
                Some(_) => {}
            }

            // The timeframe must not change inside a page.
            if self.orbit_tracking
                && (h.hb_orbit as u64) >= self.tf_orbit_begin as u64 + self.cfg.tf_period as u64
            {
                self.counters.rdh_stream_err.fetch_add(1, Ordering::Relaxed);
                if self.cfg.rdh_dump_error_enabled {
                    warn!(
                        equipment = %self.cfg.name,
                        header = index,
                        offset,
                        orbit = h.hb_orbit,
                        window_begin = self.tf_orbit_begin,
                        period = self.cfg.tf_period,
                        "timeframe change inside page"
                    );
                }
                break;
            }

            if self.cfg.rdh_check_packet_counter_contiguous && h.link_id != UNDEFINED_LINK {
                let slot = &mut self.last_packet_counter[h.link_id as usize];
                if h.packet_counter != *slot {
                    if h.packet_counter != slot.wrapping_add(1) {
                        warn!(
                            equipment = %self.cfg.name,
                            link = h.link_id,
                            from = *slot,
                            to = h.packet_counter,
                            "possible dropped packets: counter jump"
                        );
                    }
                    *slot = h.packet_counter;
                }
            }

            if h.offset_next_packet == 0 {
                break;
            }
            offset += h.offset_next_packet as usize;
        }
    }

    fn log_final_counters(&self) {
        let s = self.counters.snapshot();
        if self.cfg.rdh_check_enabled {
            info!(
                equipment = %self.cfg.name,
                timeframes = s.timeframes,
                pages = s.pages_in,
                pages_lost = s.pages_lost,
                pages_empty = s.pages_empty,
                rdh_ok = s.rdh_ok,
                rdh_err = s.rdh_err,
                rdh_stream_err = s.rdh_stream_err,
                dropped_by_driver = s.dropped_by_driver,
                "equipment stopped"
            );
        } else {
            info!(
                equipment = %self.cfg.name,
                timeframes = s.timeframes,
                pages = s.pages_in,
                pages_lost = s.pages_lost,
                pages_empty = s.pages_empty,
                "equipment stopped"
            );
        }
    }
}

impl Drop for ReadoutEquipment {
    fn drop(&mut self) {
        self.stop();
        self.state = EquipmentState::Stopped;
    }
}

/// Handle to a producer running on its own worker thread.
pub struct EquipmentHandle {
    name: String,
    worker: WorkerThread,
    counters: Arc<EquipmentCounters>,
    queue: Arc<BoundedQueue<PageRef>>,
}

impl EquipmentHandle {
    /// Start the producer and move it onto a dedicated thread.
    ///
    /// The thread performs the equipment teardown (DMA stop, driver page
    /// release) when its loop exits.
    pub fn spawn(mut equipment: ReadoutEquipment, idle_sleep: Duration) -> ReadoutResult<Self> {
        equipment.start()?;
        let name = equipment.name().to_string();
        let counters = equipment.counters();
        let queue = equipment.output_queue();
        let worker = WorkerThread::spawn(&name, idle_sleep, move || equipment.tick())
            .map_err(ReadoutError::Io)?;
        Ok(Self {
            name,
            worker,
            counters,
            queue,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue the aggregator consumes from.
    pub fn queue(&self) -> Arc<BoundedQueue<PageRef>> {
        Arc::clone(&self.queue)
    }

    pub fn snapshot(&self) -> EquipmentCounterSnapshot {
        let mut s = self.counters.snapshot();
        s.output_queue_depth = self.queue.len() as u64;
        s
    }

    /// Stop the producer loop; `wait` joins the thread.
    pub fn stop(&mut self, wait: bool) {
        self.worker.stop(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{EmulatorChannel, EmulatorConfig};
    use readout_core::PoolConfig;

    fn pool(pages: usize) -> PagePool {
        PagePool::new(&PoolConfig {
            page_count: pages,
            page_size: 36 * 1024,
            header_reserve: 4096,
            alignment: 4096,
        })
        .unwrap()
    }

    fn emulated(cfg: EquipmentConfig, emu: EmulatorConfig, pages: usize) -> ReadoutEquipment {
        ReadoutEquipment::new(
            cfg,
            DmaChannel::Emulator(EmulatorChannel::new(emu)),
            pool(pages),
        )
    }

    fn emulator(eq: &mut ReadoutEquipment) -> &mut EmulatorChannel {
        match &mut eq.channel {
            DmaChannel::Emulator(c) => c,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_tick_produces_tagged_pages() {
        let mut eq = emulated(
            EquipmentConfig {
                rdh_use_first_in_page_enabled: true,
                ..Default::default()
            },
            EmulatorConfig {
                cru_id: 5,
                link_ids: vec![3],
                orbits_per_page: 0,
                transfer_queue_depth: 2,
                ..Default::default()
            },
            4,
        );
        eq.start().unwrap();
        assert_eq!(eq.tick(), TickResult::Ok);

        let queue = eq.output_queue();
        let page = queue.pop().expect("a page was deposited");
        assert_eq!(page.header().equipment_id, 5);
        assert_eq!(page.header().link_id, 3);
        assert_eq!(page.header().timeframe_id, 1);
        assert!(page.header().data_size > 0);
    }

    #[test]
    fn test_orbit_boundary_opens_new_timeframe() {
        // 128 orbits per page, 256 orbit period: a new timeframe every
        // second page.
        let mut eq = emulated(
            EquipmentConfig {
                rdh_use_first_in_page_enabled: true,
                ..Default::default()
            },
            EmulatorConfig {
                orbits_per_page: 128,
                transfer_queue_depth: 6,
                ..Default::default()
            },
            6,
        );
        eq.start().unwrap();
        while eq.tick() == TickResult::Ok {}

        let queue = eq.output_queue();
        let mut tf_ids = Vec::new();
        while let Some(page) = queue.pop() {
            tf_ids.push(page.header().timeframe_id);
        }
        assert_eq!(tf_ids, vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(eq.counters.timeframes.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_software_clock_assigns_current_timeframe() {
        let mut eq = emulated(
            EquipmentConfig {
                // ~1 kHz software clock so the test observes increments.
                tf_period: 11,
                ..Default::default()
            },
            EmulatorConfig {
                transfer_queue_depth: 1,
                ..Default::default()
            },
            4,
        );
        eq.start().unwrap();
        eq.tick();
        let queue = eq.output_queue();
        let first_tf = queue.pop().unwrap().header().timeframe_id;

        std::thread::sleep(Duration::from_millis(10));
        eq.tick();
        let later_tf = queue.pop().unwrap().header().timeframe_id;
        assert!(later_tf > first_tf);
    }

    #[test]
    fn test_pool_exhaustion_counts_memory_low() {
        let mut eq = emulated(
            EquipmentConfig::default(),
            EmulatorConfig {
                transfer_queue_depth: 8,
                ..Default::default()
            },
            2,
        );
        eq.start().unwrap();
        eq.tick();
        assert!(eq.counters.memory_low.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_full_output_queue_stalls_without_dropping() {
        let mut eq = emulated(
            EquipmentConfig {
                output_queue_capacity: 2,
                ..Default::default()
            },
            EmulatorConfig {
                transfer_queue_depth: 4,
                ..Default::default()
            },
            4,
        );
        let pool = eq.pool.clone();
        eq.start().unwrap();
        eq.tick();
        eq.tick();

        assert!(eq.counters.push_blocked_idle.load(Ordering::Relaxed) > 0);
        // Nothing dropped: every page is in the queue, the driver, or free.
        let queue = eq.output_queue();
        assert_eq!(queue.len(), 2);
        eq.stop();
        drop(eq);
        queue.clear();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_rdh_check_counts_headers() {
        let mut eq = emulated(
            EquipmentConfig {
                rdh_check_enabled: true,
                ..Default::default()
            },
            EmulatorConfig {
                packets_per_page: 3,
                transfer_queue_depth: 1,
                ..Default::default()
            },
            2,
        );
        eq.start().unwrap();
        eq.tick();
        assert_eq!(eq.counters.rdh_ok.load(Ordering::Relaxed), 3);
        assert_eq!(eq.counters.rdh_err.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_corrupt_header_counted_page_kept() {
        let mut eq = emulated(
            EquipmentConfig {
                rdh_check_enabled: true,
                ..Default::default()
            },
            EmulatorConfig {
                transfer_queue_depth: 1,
                ..Default::default()
            },
            2,
        );
        eq.start().unwrap();
        emulator(&mut eq).corrupt_next_page();
        eq.tick();

        assert_eq!(eq.counters.rdh_err.load(Ordering::Relaxed), 1);
        // The page is delivered regardless.
        assert_eq!(eq.output_queue().len(), 1);
    }

    #[test]
    fn test_inconsistent_link_stops_scan() {
        let mut eq = emulated(
            EquipmentConfig {
                rdh_check_enabled: true,
                ..Default::default()
            },
            EmulatorConfig {
                link_ids: vec![0, 1],
                packets_per_page: 4,
                transfer_queue_depth: 1,
                ..Default::default()
            },
            2,
        );
        eq.start().unwrap();
        eq.tick();
        assert_eq!(eq.counters.rdh_stream_err.load(Ordering::Relaxed), 1);
        // First header passed, second broke the scan.
        assert_eq!(eq.counters.rdh_ok.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_rdh_dump_budget_counts_pages_not_headers() {
        // A one-deep driver queue harvests one page per tick; each page
        // carries four embedded frame headers.
        let mut eq = emulated(
            EquipmentConfig {
                rdh_dump_enabled: -2,
                ..Default::default()
            },
            EmulatorConfig {
                packets_per_page: 4,
                transfer_queue_depth: 1,
                ..Default::default()
            },
            4,
        );
        eq.start().unwrap();
        assert_eq!(eq.dump_budget, -2);
        let queue = eq.output_queue();

        // First page: one unit of budget for the whole header chain,
        // not one per header.
        eq.tick();
        assert_eq!(queue.len(), 1);
        assert_eq!(eq.dump_budget, -1);

        queue.clear();
        eq.tick();
        assert_eq!(eq.dump_budget, 0);

        // Budget exhausted: further pages dump nothing.
        queue.clear();
        eq.tick();
        assert_eq!(queue.len(), 1);
        assert_eq!(eq.dump_budget, 0);
    }

    #[test]
    fn test_dropped_packets_escalate_with_stop_on_error() {
        let mut eq = emulated(
            EquipmentConfig {
                stop_on_error: true,
                ..Default::default()
            },
            EmulatorConfig {
                transfer_queue_depth: 1,
                ..Default::default()
            },
            2,
        );
        eq.start().unwrap();
        assert_eq!(eq.tick(), TickResult::Ok); // baseline read
        emulator(&mut eq).inject_dropped(3);
        eq.drop_timer.reset(Duration::from_secs(0));
        // The fatal condition fires after the quantum completes.
        assert_eq!(eq.tick(), TickResult::Error);
        assert_eq!(eq.counters.dropped_by_driver.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_stop_releases_driver_pages() {
        let pool = pool(4);
        let mut eq = ReadoutEquipment::new(
            EquipmentConfig {
                output_queue_capacity: 2,
                ..Default::default()
            },
            DmaChannel::Emulator(EmulatorChannel::new(EmulatorConfig {
                transfer_queue_depth: 4,
                ..Default::default()
            })),
            pool.clone(),
        );
        eq.start().unwrap();
        eq.tick();
        // Two pages in the output queue, two still owned by the driver.
        assert_eq!(pool.available(), 0);

        let queue = eq.output_queue();
        eq.stop();
        assert_eq!(pool.available(), 2);
        queue.clear();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_spawned_producer_runs_and_stops() {
        let eq = emulated(
            EquipmentConfig {
                name: "spawned".into(),
                output_queue_capacity: 512,
                ..Default::default()
            },
            EmulatorConfig {
                transfer_queue_depth: 4,
                ..Default::default()
            },
            8,
        );
        let mut handle = EquipmentHandle::spawn(eq, Duration::from_millis(1)).unwrap();
        let queue = handle.queue();
        while queue.is_empty() {
            std::thread::yield_now();
        }
        handle.stop(true);
        assert!(handle.snapshot().pages_in > 0);
    }
}
