//! The DMA channel seam.
//!
//! The concrete readout hardware lives behind this interface. Equipment
//! kinds (emulator, file replay) expose one capability set — start/stop,
//! transfer-queue refill, ready-queue harvest, dropped-packet counter —
//! selected by tagged variant rather than trait objects, so the producer's
//! hot loop dispatches with a plain `match`.

use crate::emulator::EmulatorChannel;
use crate::replay::ReplayChannel;
use readout_core::DriverError;
use readout_pool::PageRef;

/// One DMA transfer unit: a pooled page travelling through the driver.
///
/// The page handle rides along as the driver's user data; `received` and
/// `ready` are filled by the driver when the transfer completes. A
/// superpage popped with `ready == false` is a leftover from a stopped
/// channel and carries no data.
#[derive(Debug)]
pub struct Superpage {
    pub page: PageRef,
    pub received: u32,
    pub ready: bool,
}

impl Superpage {
    pub fn new(page: PageRef) -> Self {
        Self {
            page,
            received: 0,
            ready: false,
        }
    }

    /// Byte offset of the transfer target within the registered block.
    pub fn dma_offset(&self) -> usize {
        self.page.dma_offset()
    }
}

/// A DMA channel of some equipment kind.
pub enum DmaChannel {
    Emulator(EmulatorChannel),
    Replay(ReplayChannel),
}

impl DmaChannel {
    /// Enable DMA. Until then pushes are refused.
    pub fn start_dma(&mut self) -> Result<(), DriverError> {
        match self {
            DmaChannel::Emulator(c) => c.start_dma(),
            DmaChannel::Replay(c) => c.start_dma(),
        }
    }

    /// Disable DMA. Queued transfers come back not-ready on the next pops.
    pub fn stop_dma(&mut self) -> Result<(), DriverError> {
        match self {
            DmaChannel::Emulator(c) => c.stop_dma(),
            DmaChannel::Replay(c) => c.stop_dma(),
        }
    }

    /// Free slots in the transfer queue. 0 while the channel is stopped.
    pub fn transfer_queue_available(&self) -> usize {
        match self {
            DmaChannel::Emulator(c) => c.transfer_queue_available(),
            DmaChannel::Replay(c) => c.transfer_queue_available(),
        }
    }

    /// Submit a page for transfer; a refused submission hands the
    /// superpage back (typically the channel was stopped meanwhile).
    pub fn push_superpage(&mut self, sp: Superpage) -> Result<(), Superpage> {
        match self {
            DmaChannel::Emulator(c) => c.push_superpage(sp),
            DmaChannel::Replay(c) => c.push_superpage(sp),
        }
    }

    /// Driver internal business; called once per tick.
    pub fn fill_superpages(&mut self) {
        match self {
            DmaChannel::Emulator(c) => c.fill_superpages(),
            DmaChannel::Replay(c) => c.fill_superpages(),
        }
    }

    /// Completed transfers waiting to be popped.
    pub fn ready_queue_size(&self) -> usize {
        match self {
            DmaChannel::Emulator(c) => c.ready_queue_size(),
            DmaChannel::Replay(c) => c.ready_queue_size(),
        }
    }

    pub fn pop_superpage(&mut self) -> Option<Superpage> {
        match self {
            DmaChannel::Emulator(c) => c.pop_superpage(),
            DmaChannel::Replay(c) => c.pop_superpage(),
        }
    }

    /// Cumulative dropped-packet counter as reported by the hardware.
    pub fn dropped_packets(&self) -> i32 {
        match self {
            DmaChannel::Emulator(c) => c.dropped_packets(),
            DmaChannel::Replay(c) => c.dropped_packets(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DmaChannel::Emulator(_) => "emulator",
            DmaChannel::Replay(_) => "replay",
        }
    }
}
