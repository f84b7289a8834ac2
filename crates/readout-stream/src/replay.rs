//! File replay DMA channel.
//!
//! Loads a data file once at open and serves it as the content of every
//! completed page, truncated to the usable page size. Useful to feed
//! recorded detector data through the full path without hardware. An
//! optional page budget stops the stream after N pages; pages queued past
//! the budget come back not-ready, like a stopped hardware channel.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::driver::Superpage;
use anyhow::{ensure, Context};
use readout_core::{DriverError, DriverErrorKind};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub path: PathBuf,
    /// Stop after this many pages; 0 = unlimited.
    pub page_budget: u64,
    /// Transfer queue depth, like the hardware FIFO.
    pub transfer_queue_depth: usize,
}

impl ReplayConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            page_budget: 0,
            transfer_queue_depth: 32,
        }
    }
}

pub struct ReplayChannel {
    cfg: ReplayConfig,
    data: Vec<u8>,
    running: bool,
    transfer: VecDeque<Superpage>,
    ready: VecDeque<Superpage>,
    pages_emitted: u64,
}

impl ReplayChannel {
    /// Read the replay file into memory.
    pub fn open(cfg: ReplayConfig) -> anyhow::Result<Self> {
        let data = std::fs::read(&cfg.path)
            .with_context(|| format!("reading replay file {}", cfg.path.display()))?;
        ensure!(!data.is_empty(), "replay file {} is empty", cfg.path.display());
        info!(
            path = %cfg.path.display(),
            bytes = data.len(),
            page_budget = cfg.page_budget,
            "replay channel loaded"
        );
        Ok(Self {
            cfg,
            data,
            running: false,
            transfer: VecDeque::new(),
            ready: VecDeque::new(),
            pages_emitted: 0,
        })
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
            if self.cfg.page_budget != 0 && self.pages_emitted >= self.cfg.page_budget {
                // Budget exhausted: hand the page back not-ready.
                self.ready.push_back(sp);
                continue;
            }
            let payload = sp.page.payload_mut();
            let len = self.data.len().min(payload.len());
            payload[..len].copy_from_slice(&self.data[..len]);
            sp.received = len as u32;
            sp.ready = true;
            self.pages_emitted += 1;
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
        0
    }
}
