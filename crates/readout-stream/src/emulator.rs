//! Software DMA channel generating framed data.
//!
//! The emulator behaves like the hardware channel seen from the producer:
//! pages queue for transfer, `fill_superpages()` completes them, completed
//! pages wait in a ready queue. Each completed page carries a chain of
//! embedded frame headers cycling over the configured links, with the
//! heartbeat orbit advancing by a fixed amount per page and per-link
//! packet counters incrementing mod 256.
//!
//! Fault injection hooks (`inject_dropped`, `corrupt_next_page`) let tests
//! exercise the producer's error paths deterministically.

use std::collections::VecDeque;

use crate::driver::Superpage;
use readout_core::{DriverError, DriverErrorKind, RdhHeader, MAX_LINKS, RDH_SIZE};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Equipment id written into each frame header.
    pub cru_id: u16,
    /// Links the generator cycles over, one frame per step.
    pub link_ids: Vec<u8>,
    /// Frames written per page.
    pub packets_per_page: u32,
    /// Payload bytes per frame.
    pub packet_payload: u16,
    /// Heartbeat-orbit advance after each completed page.
    pub orbits_per_page: u32,
    /// Transfer queue depth, like the hardware FIFO.
    pub transfer_queue_depth: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            cru_id: 1,
            link_ids: vec![0],
            packets_per_page: 4,
            packet_payload: 1024,
            orbits_per_page: 32,
            transfer_queue_depth: 32,
        }
    }
}

pub struct EmulatorChannel {
    cfg: EmulatorConfig,
    running: bool,
    transfer: VecDeque<Superpage>,
    ready: VecDeque<Superpage>,
    hb_orbit: u32,
    packet_counters: [u8; MAX_LINKS as usize],
    link_cursor: usize,
    dropped: i32,
    corrupt_next: bool,
}

impl EmulatorChannel {
    pub fn new(cfg: EmulatorConfig) -> Self {
        debug!(
            cru_id = cfg.cru_id,
            links = cfg.link_ids.len(),
            depth = cfg.transfer_queue_depth,
            "emulator channel created"
        );
        Self {
            cfg,
            running: false,
            transfer: VecDeque::new(),
            ready: VecDeque::new(),
            hb_orbit: 0,
            packet_counters: [0; MAX_LINKS as usize],
            link_cursor: 0,
            dropped: 0,
            corrupt_next: false,
        }
    }

    pub fn start_dma(&mut self) -> Result<(), DriverError> {
        if self.running {
            return Err(DriverError::new(DriverErrorKind::Start, "already running"));
        }
        self.running = true;
        Ok(())
    }

    pub fn stop_dma(&mut self) -> Result<(), DriverError> {
        self.running = false;
        // Pending transfers come back not-ready, like hardware on stop.
        while let Some(sp) = self.transfer.pop_front() {
            self.ready.push_back(sp);
        }
        Ok(())
    }

    pub fn transfer_queue_available(&self) -> usize {
        if !self.running {
            return 0;
        }
        self.cfg.transfer_queue_depth - self.transfer.len()
    }

    pub fn push_superpage(&mut self, sp: Superpage) -> Result<(), Superpage> {
        if !self.running || self.transfer.len() >= self.cfg.transfer_queue_depth {
            return Err(sp);
        }
        self.transfer.push_back(sp);
        Ok(())
    }

    pub fn fill_superpages(&mut self) {
        if !self.running {
            return;
        }
        while let Some(mut sp) = self.transfer.pop_front() {
            let written = self.write_page(&mut sp);
            sp.received = written;
            sp.ready = true;
            self.ready.push_back(sp);
        }
    }

    pub fn ready_queue_size(&self) -> usize {
        self.ready.len()
    }

    pub fn pop_superpage(&mut self) -> Option<Superpage> {
        self.ready.pop_front()
    }

    pub fn dropped_packets(&self) -> i32 {
        self.dropped
    }

    /// Raise the cumulative dropped-packet counter (test hook).
    pub fn inject_dropped(&mut self, n: i32) {
        self.dropped += n;
    }

    /// Corrupt the first frame header of the next generated page
    /// (test hook).
    pub fn corrupt_next_page(&mut self) {
        self.corrupt_next = true;
    }

    /// Write one page worth of framed packets; returns bytes written.
    fn write_page(&mut self, sp: &mut Superpage) -> u32 {
        let frame_len = RDH_SIZE + self.cfg.packet_payload as usize;
        let capacity = sp.page.payload().len();
        let frames = (self.cfg.packets_per_page as usize)
            .max(1)
            .min(capacity / frame_len);
        if frames == 0 {
            return 0;
        }

        let mut offset = 0usize;
        for i in 0..frames {
            let link = self.cfg.link_ids[self.link_cursor % self.cfg.link_ids.len()];
            self.link_cursor += 1;
            let counter = &mut self.packet_counters[(link as usize) % MAX_LINKS as usize];
            let header = RdhHeader {
                version: 6,
                header_size: RDH_SIZE as u8,
                block_length: self.cfg.packet_payload,
                offset_next_packet: if i + 1 == frames { 0 } else { frame_len as u16 },
                cru_id: self.cfg.cru_id,
                link_id: link,
                packet_counter: *counter,
                hb_orbit: self.hb_orbit,
            };
            *counter = counter.wrapping_add(1);

            let payload = sp.page.payload_mut();
            header.encode_into(&mut payload[offset..]);
            let body = &mut payload[offset + RDH_SIZE..offset + frame_len];
            body.fill((i & 0xFF) as u8);
            offset += frame_len;
        }

        if self.corrupt_next {
            self.corrupt_next = false;
            sp.page.payload_mut()[0] = 0; // unknown header version
        }

        self.hb_orbit = self.hb_orbit.wrapping_add(self.cfg.orbits_per_page);
        offset as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_core::PoolConfig;
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

    #[test]
    fn test_push_refused_while_stopped() {
        let pool = pool();
        let mut chan = EmulatorChannel::new(EmulatorConfig::default());
        assert_eq!(chan.transfer_queue_available(), 0);
        let sp = Superpage::new(pool.acquire().unwrap());
        assert!(chan.push_superpage(sp).is_err());
    }

    #[test]
    fn test_fill_produces_valid_frame_chain() {
        let pool = pool();
        let mut chan = EmulatorChannel::new(EmulatorConfig {
            cru_id: 7,
            link_ids: vec![2, 3],
            packets_per_page: 4,
            packet_payload: 256,
            ..Default::default()
        });
        chan.start_dma().unwrap();
        chan.push_superpage(Superpage::new(pool.acquire().unwrap()))
            .unwrap();
        chan.fill_superpages();

        let sp = chan.pop_superpage().unwrap();
        assert!(sp.ready);
        assert_eq!(sp.received as usize, 4 * (RDH_SIZE + 256));

        // Walk the chain.
        let payload = sp.page.payload();
        let mut offset = 0usize;
        let mut links = Vec::new();
        loop {
            let h = RdhHeader::decode(&payload[offset..]).unwrap();
            h.validate().unwrap();
            assert_eq!(h.cru_id, 7);
            links.push(h.link_id);
            if h.offset_next_packet == 0 {
                break;
            }
            offset += h.offset_next_packet as usize;
        }
        assert_eq!(links, vec![2, 3, 2, 3]);
    }

    #[test]
    fn test_orbit_advances_per_page() {
        let pool = pool();
        let mut chan = EmulatorChannel::new(EmulatorConfig {
            orbits_per_page: 100,
            ..Default::default()
        });
        chan.start_dma().unwrap();
        for _ in 0..2 {
            chan.push_superpage(Superpage::new(pool.acquire().unwrap()))
                .unwrap();
        }
        chan.fill_superpages();

        let first = chan.pop_superpage().unwrap();
        let second = chan.pop_superpage().unwrap();
        let h1 = RdhHeader::decode(first.page.payload()).unwrap();
        let h2 = RdhHeader::decode(second.page.payload()).unwrap();
        assert_eq!(h1.hb_orbit, 0);
        assert_eq!(h2.hb_orbit, 100);
    }

    #[test]
    fn test_stop_returns_pending_not_ready() {
        let pool = pool();
        let mut chan = EmulatorChannel::new(EmulatorConfig::default());
        chan.start_dma().unwrap();
        chan.push_superpage(Superpage::new(pool.acquire().unwrap()))
            .unwrap();
        chan.stop_dma().unwrap();

        let sp = chan.pop_superpage().unwrap();
        assert!(!sp.ready);
        drop(sp);
        assert_eq!(pool.available(), 8);
    }
}
