//! 16-byte data FIFO and transfer requests.
//!
//! The FIFO sits between the live engine and the host. In read direction the
//! engine pushes and the host (PIO or DMA) pops; in write direction it is
//! the other way round. Over/underflow on the engine side sets ST1 OR.

use emu_core::Time;
use tracing::{trace, warn};

use crate::Upd765;
use crate::registers::{FIF_DIS, FIF_THR, SPEC_ND, ST1_OR};

pub(crate) const FIFO_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fifo {
    data: [u8; FIFO_SIZE],
    len: usize,
    /// Bytes still to move for the current transfer.
    pub expected: usize,
    /// Host writes, engine reads.
    pub write: bool,
}

impl Fifo {
    pub fn new() -> Self {
        Self {
            data: [0; FIFO_SIZE],
            len: 0,
            expected: 0,
            write: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == FIFO_SIZE
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.expected = 0;
    }

    fn push(&mut self, byte: u8) {
        self.data[self.len] = byte;
        self.len += 1;
    }

    fn pop(&mut self) -> u8 {
        let byte = self.data[0];
        self.data.copy_within(1..self.len, 0);
        self.len -= 1;
        byte
    }
}

impl Upd765 {
    /// Transfer threshold from CONFIGURE, 1-16.
    fn fifo_threshold(&self) -> usize {
        usize::from(self.fifocfg & FIF_THR) + 1
    }

    /// Put a byte into the FIFO. `internal` is the engine side.
    pub(crate) fn fifo_push(&mut self, data: u8, internal: bool) {
        if self.fifo.is_full() {
            if internal {
                warn!(data, "fifo overrun");
                self.st1 |= ST1_OR;
            }
            return;
        }
        self.fifo.push(data);
        self.fifo.expected = self.fifo.expected.saturating_sub(1);

        if !self.fifo.write
            && (self.fifo.expected == 0 || self.fifo.len() >= self.fifo_threshold() || self.fifocfg & FIF_DIS != 0)
        {
            self.enable_transfer();
        }
        if self.fifo.write && (self.fifo.is_full() || self.fifo.expected == 0) {
            self.disable_transfer();
        }
    }

    /// Take a byte from the FIFO. An empty FIFO yields 0.
    pub(crate) fn fifo_pop(&mut self, internal: bool) -> u8 {
        if self.fifo.is_empty() {
            if internal {
                warn!("fifo underrun");
                self.st1 |= ST1_OR;
            }
            return 0;
        }
        let byte = self.fifo.pop();
        if !self.fifo.write && self.fifo.is_empty() {
            self.disable_transfer();
        }
        if self.fifo.write
            && self.fifo.expected != 0
            && (self.fifo.len() <= usize::from(self.fifocfg & FIF_THR) || self.fifocfg & FIF_DIS != 0)
        {
            self.enable_transfer();
        }
        byte
    }

    /// Arm the FIFO for a transfer of `size` bytes.
    pub(crate) fn fifo_expect(&mut self, size: usize, write: bool) {
        self.fifo.expected = size;
        self.fifo.write = write;
        if write {
            self.enable_transfer();
        }
    }

    /// Request service from the host: RQM in non-DMA mode, DRQ otherwise.
    pub(crate) fn enable_transfer(&mut self) {
        if self.spec & SPEC_ND != 0 {
            if !self.internal_drq {
                self.internal_drq = true;
                self.check_irq();
            }
        } else if self.drq.set(true) {
            trace!("drq on");
        }
    }

    pub(crate) fn disable_transfer(&mut self) {
        if self.spec & SPEC_ND != 0 {
            self.internal_drq = false;
            self.check_irq();
        } else if self.drq.set(false) {
            trace!("drq off");
        }
    }

    /// DMA acknowledge, read direction.
    pub fn dma_read(&mut self, now: Time) -> u8 {
        self.run_until(now);
        self.fifo_pop(false)
    }

    /// DMA acknowledge, write direction.
    pub fn dma_write(&mut self, data: u8, now: Time) {
        self.run_until(now);
        self.fifo_push(data, false);
    }
}
