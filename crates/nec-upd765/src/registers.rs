//! Host register file.
//!
//! | Offset | Full map read | Full map write | Compact read | Compact write |
//! |---|---|---|---|---|
//! | 0 | SRA | - | MSR | - |
//! | 1 | SRB | - | data | data |
//! | 2 | DOR | DOR | | |
//! | 3 | TDR | TDR | | |
//! | 4 | MSR | DSR | | |
//! | 5 | data | data | | |
//! | 6 | - | - | | |
//! | 7 | DIR | CCR | | |

use emu_core::Time;
use tracing::{debug, trace, warn};

use crate::config::{Mode, RATES, RegisterMap};
use crate::drive::{MainState, SubState};
use crate::live::LiveState;
use crate::{Phase, Upd765};

// Main status register
pub const MSR_RQM: u8 = 0x80;
pub const MSR_DIO: u8 = 0x40;
pub const MSR_EXM: u8 = 0x20;
pub const MSR_CB: u8 = 0x10;

pub const ST0_UNIT: u8 = 0x07;
pub const ST0_NR: u8 = 0x08;
pub const ST0_EC: u8 = 0x10;
pub const ST0_SE: u8 = 0x20;
pub const ST0_FAIL: u8 = 0x40;
pub const ST0_UNK: u8 = 0x80;
pub const ST0_ABRT: u8 = 0xC0;

pub const ST1_MA: u8 = 0x01;
pub const ST1_NW: u8 = 0x02;
pub const ST1_ND: u8 = 0x04;
pub const ST1_OR: u8 = 0x10;
pub const ST1_DE: u8 = 0x20;
pub const ST1_EN: u8 = 0x80;

pub const ST2_MD: u8 = 0x01;
pub const ST2_BC: u8 = 0x02;
pub const ST2_SN: u8 = 0x04;
pub const ST2_SH: u8 = 0x08;
pub const ST2_WC: u8 = 0x10;
pub const ST2_DD: u8 = 0x20;
pub const ST2_CM: u8 = 0x40;

pub const ST3_TS: u8 = 0x08;
pub const ST3_T0: u8 = 0x10;
pub const ST3_RY: u8 = 0x20;
pub const ST3_WP: u8 = 0x40;

// CONFIGURE byte 2
pub const FIF_THR: u8 = 0x0F;
pub const FIF_POLL: u8 = 0x10;
pub const FIF_DIS: u8 = 0x20;
pub const FIF_EIS: u8 = 0x40;

/// SPECIFY non-DMA bit.
pub const SPEC_ND: u16 = 0x0001;

const DOR_RESET: u8 = 0x04;
const DOR_DMA_GATE: u8 = 0x08;

impl Upd765 {
    /// Read a host register. Unmapped offsets read 0xFF.
    pub fn read_register(&mut self, offset: u8, now: Time) -> u8 {
        self.run_until(now);
        let value = match self.config.registers {
            RegisterMap::Compact => match offset & 1 {
                0 => self.msr(),
                _ => self.fifo_r(),
            },
            RegisterMap::Full => match offset & 7 {
                0 => self.sra(),
                1 => 0x00,
                2 => self.dor,
                3 => 0x00,
                4 => self.msr(),
                5 => self.fifo_r(),
                7 => self.dir(),
                _ => 0xFF,
            },
        };
        trace!(offset, value, "register read");
        value
    }

    pub fn write_register(&mut self, offset: u8, value: u8, now: Time) {
        self.run_until(now);
        trace!(offset, value, "register write");
        match self.config.registers {
            RegisterMap::Compact => match offset & 1 {
                1 => self.fifo_w(value),
                _ => warn!(value, "write to status register ignored"),
            },
            RegisterMap::Full => match offset & 7 {
                2 => self.dor_w(value),
                3 => {}
                4 => self.dsr_w(value),
                5 => self.fifo_w(value),
                7 => self.ccr_w(value),
                other => warn!(offset = other, value, "write to read-only register ignored"),
            },
        }
    }

    /// Main status register, whichever map is in use.
    pub fn read_msr(&mut self, now: Time) -> u8 {
        self.run_until(now);
        self.msr()
    }

    /// Data register, whichever map is in use.
    pub fn read_data(&mut self, now: Time) -> u8 {
        self.run_until(now);
        self.fifo_r()
    }

    pub fn write_data(&mut self, value: u8, now: Time) {
        self.run_until(now);
        self.fifo_w(value);
    }

    /// MSR read: a pending data-phase interrupt is acknowledged.
    fn msr(&mut self) -> u8 {
        let msr = self.msr_value();
        if self.data_irq {
            self.data_irq = false;
            self.check_irq();
        }
        msr
    }

    pub(crate) fn msr_value(&self) -> u8 {
        let mut msr = match self.phase {
            Phase::Command if self.command_pos != 0 => MSR_RQM | MSR_CB,
            Phase::Command => MSR_RQM,
            Phase::Execution => {
                let mut msr = MSR_CB;
                if self.spec & SPEC_ND != 0 {
                    msr |= MSR_EXM;
                }
                if self.internal_drq {
                    msr |= MSR_RQM;
                    if !self.fifo.write {
                        msr |= MSR_DIO;
                    }
                }
                msr
            }
            Phase::Result => MSR_RQM | MSR_DIO | MSR_CB,
        };
        for (i, drive) in self.drives.iter().enumerate() {
            if drive.is_seeking() {
                msr |= 1 << i;
            }
        }
        msr
    }

    /// Status register A (PS/2 layout, inverted low bits in Model 30 mode).
    fn sra(&self) -> u8 {
        let drive = &self.drives[usize::from(self.dor & 3)];
        let mut sra = 0x40;
        if drive.dir_outward {
            sra |= 0x01;
        }
        if drive.index {
            sra |= 0x04;
        }
        if self.rate >= 500_000 {
            sra |= 0x08;
        }
        // TRK0 is active low.
        if !drive.with_medium(|m| m.track0()).unwrap_or(false) {
            sra |= 0x10;
        }
        if drive.sub_state == SubState::SeekWaitStepSignalTime {
            sra |= 0x20;
        }
        if self.irq.level() {
            sra |= 0x80;
        }
        if self.config.mode == Mode::M30 {
            sra ^= 0x1F;
        }
        sra
    }

    fn dir(&self) -> u8 {
        let drive = &self.drives[usize::from(self.dor & 3)];
        if drive.with_medium(|m| m.disk_changed()).unwrap_or(false) {
            0x80
        } else {
            0x00
        }
    }

    fn dor_w(&mut self, data: u8) {
        let changed = self.dor ^ data;
        self.dor = data;
        if changed & DOR_RESET != 0 {
            self.soft_reset();
        }
        let now = self.now;
        // Without select lines the four slots share one drive, wired to MOTA.
        let wired = if self.config.select_connected { 4 } else { 1 };
        for (i, drive) in self.drives.iter().enumerate().take(wired) {
            let on = data & (0x10 << i) != 0;
            drive.with_medium_mut(|m| m.set_motor(on, now));
        }
        self.check_irq();
    }

    fn dsr_w(&mut self, data: u8) {
        if data & 0x80 != 0 {
            self.soft_reset();
        }
        self.dsr = data & 0x7F;
        self.rate = RATES[usize::from(self.dsr & 3)];
    }

    fn ccr_w(&mut self, data: u8) {
        self.dsr = (self.dsr & 0xFC) | (data & 3);
        self.rate = RATES[usize::from(data & 3)];
    }

    fn fifo_r(&mut self) -> u8 {
        match self.phase {
            Phase::Execution if self.internal_drq => self.fifo_pop(false),
            Phase::Result if self.result_read < self.result_len => {
                let value = self.result[self.result_read];
                self.result_read += 1;
                if self.result_read == self.result_len {
                    self.result_read = 0;
                    self.result_len = 0;
                    self.phase = Phase::Command;
                }
                value
            }
            phase => {
                warn!(?phase, "data register read with nothing to give");
                0xFF
            }
        }
    }

    fn fifo_w(&mut self, data: u8) {
        match self.phase {
            Phase::Command => {
                if self.command_pos == self.command.len() {
                    warn!(data, "command buffer full");
                    return;
                }
                self.command[self.command_pos] = data;
                self.command_pos += 1;
                self.other_irq = false;
                self.check_irq();
                self.dispatch_command();
            }
            Phase::Execution if self.internal_drq => self.fifo_push(data, false),
            phase => warn!(?phase, data, "data register write ignored"),
        }
    }

    /// Recompute the interrupt line.
    pub(crate) fn check_irq(&mut self) {
        let pending = self.data_irq || self.other_irq || self.internal_drq;
        let enabled = self.dor & DOR_RESET != 0 && (self.config.mode != Mode::At || self.dor & DOR_DMA_GATE != 0);
        let level = pending && enabled;
        if self.irq.set(level) {
            trace!(level, "irq");
        }
    }

    /// Reset everything but the locked FIFO configuration and the data rate.
    pub(crate) fn soft_reset(&mut self) {
        if self.live.drive.is_some() {
            self.live_abort();
        }
        self.phase = Phase::Command;
        let ready = !self.config.ready_polled;
        for (i, drive) in self.drives.iter_mut().enumerate() {
            drive.main_state = MainState::Idle;
            drive.sub_state = SubState::Idle;
            drive.live = false;
            drive.ready = ready;
            drive.st0 = i as u8;
            drive.st0_filled = false;
            drive.timer = Time::NEVER;
        }
        self.data_irq = false;
        self.other_irq = false;
        self.internal_drq = false;
        self.fifo.clear();
        self.command_pos = 0;
        self.result_len = 0;
        self.result_read = 0;
        if !self.locked {
            self.fifocfg = FIF_DIS;
        }
        self.drq.set(false);
        self.live.tm = Time::NEVER;
        self.live.state = LiveState::Idle;
        self.live.next_state = None;
        self.live.drive = None;
        self.checkpoint_live = self.live.clone();
        self.tc_done = false;
        self.st1 = 0;
        self.st2 = 0;
        self.st3 = 0;
        self.check_irq();
        self.poll_at = if self.config.ready_polled {
            self.now + Time::from_micros(100)
        } else {
            Time::NEVER
        };
        debug!(at = %self.now, "soft reset");
    }

    /// Power-on / RESET pin.
    pub fn reset(&mut self, now: Time) {
        self.run_until(now);
        self.dor = self.config.dor_reset;
        self.locked = false;
        self.soft_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    const T: Time = Time::from_micros(1);

    fn full() -> Upd765 {
        let mut fdc = Upd765::new(Config::n82077aa());
        fdc.write_register(2, 0x0C, T);
        fdc
    }

    #[test]
    fn idle_msr_accepts_commands() {
        let mut fdc = Upd765::new(Config::default());
        assert_eq!(fdc.read_register(0, T), MSR_RQM);
        fdc.write_register(1, 0x03, T);
        assert_eq!(fdc.read_register(0, T), MSR_RQM | MSR_CB, "partial command sets CB");
    }

    #[test]
    fn invalid_opcode_answers_0x80() {
        let mut fdc = Upd765::new(Config::default());
        fdc.write_data(0x1F, T);
        assert_eq!(fdc.phase(), Phase::Result);
        assert_eq!(fdc.read_msr(T), MSR_RQM | MSR_DIO | MSR_CB);
        assert_eq!(fdc.read_data(T), ST0_UNK);
        assert_eq!(fdc.phase(), Phase::Command, "last result byte ends the result phase");
        assert_eq!(fdc.read_data(T), 0xFF, "nothing left to read");
    }

    #[test]
    fn full_map_layout() {
        let mut fdc = full();
        assert_eq!(fdc.read_register(2, T), 0x0C);
        assert_eq!(fdc.read_register(1, T), 0x00, "SRB");
        assert_eq!(fdc.read_register(3, T), 0x00, "TDR");
        assert_eq!(fdc.read_register(6, T), 0xFF, "unmapped");
        assert_eq!(fdc.read_register(4, T), MSR_RQM);
        assert_eq!(fdc.read_register(7, T), 0x00, "no drive, no disk change");
    }

    #[test]
    fn rate_select_through_dsr_and_ccr() {
        let mut fdc = full();
        fdc.write_register(4, 0x00, T);
        assert_eq!(fdc.rate, 500_000);
        assert_ne!(fdc.read_register(0, T) & 0x08, 0, "SRA reports high rate");
        fdc.write_register(7, 0x02, T);
        assert_eq!(fdc.rate, 250_000);
        assert_eq!(fdc.dsr & 3, 2);
        fdc.write_register(4, 0x03, T);
        assert_eq!(fdc.rate, 1_000_000);
    }

    #[test]
    fn sra_model_30_inverts_low_bits() {
        let mut fdc = Upd765::new(Config {
            mode: Mode::M30,
            ..Config::n82077aa()
        });
        fdc.write_register(2, 0x0C, T);
        let sra = fdc.read_register(0, T);
        assert_eq!(sra & 0x40, 0x40);
        assert_eq!(sra & 0x10, 0x00, "no drive reads as not-TRK0, then inverted");
    }

    #[test]
    fn dor_gates_interrupt_in_at_mode() {
        let mut fdc = Upd765::new(Config::n82077aa());
        fdc.other_irq = true;
        fdc.check_irq();
        assert!(!fdc.irq(), "controller held in reset");
        fdc.dor = 0x04;
        fdc.check_irq();
        assert!(!fdc.irq(), "AT mode needs DMA gate");
        fdc.dor = 0x0C;
        fdc.check_irq();
        assert!(fdc.irq());

        let mut ps2 = Upd765::new(Config {
            mode: Mode::Ps2,
            ..Config::n82077aa()
        });
        ps2.dor = 0x04;
        ps2.other_irq = true;
        ps2.check_irq();
        assert!(ps2.irq());
    }

    #[test]
    fn reading_msr_clears_data_interrupt() {
        let mut fdc = Upd765::new(Config::default());
        fdc.data_irq = true;
        fdc.check_irq();
        assert!(fdc.irq());
        fdc.read_msr(T);
        assert!(!fdc.irq());
    }

    #[test]
    fn soft_reset_via_dsr() {
        let mut fdc = full();
        fdc.write_data(0x03, T);
        assert_eq!(fdc.command_pos, 1);
        fdc.fifocfg = 0x4F;
        fdc.write_register(4, 0x82, T);
        assert_eq!(fdc.command_pos, 0);
        assert_eq!(fdc.fifocfg, FIF_DIS, "unlocked configuration resets");
        assert_eq!(fdc.rate, 250_000);
    }

    #[test]
    fn hard_reset_restores_dor_and_unlocks() {
        let mut fdc = full();
        fdc.locked = true;
        fdc.fifocfg = 0x4F;
        fdc.reset(T);
        assert_eq!(fdc.dor, 0x00);
        assert!(!fdc.locked);
        assert_eq!(fdc.fifocfg, FIF_DIS);
    }
}
