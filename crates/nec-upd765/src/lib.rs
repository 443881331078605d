//! NEC uPD765-family floppy disk controller.
//!
//! Covers the uPD765A/B, Intel 8272A, 82077AA, SMC 37C78 and the PC
//! super-I/O FDC as one chip with a [`Config`] that picks the variant.
//! Unlike a sector-level model, the controller reads and writes the flux
//! stream of a [`Medium`] bit by bit through a digital PLL, so copy
//! protections, odd gaps and mid-sector TC behave as on hardware.
//!
//! # Structure
//!
//! | Module | Role |
//! |---|---|
//! | `registers` | host register file, MSR, interrupt line, resets |
//! | `commands` | command decode and the per-drive command state machines |
//! | `live` | the bitstream engine with checkpoint and rollback |
//! | `pll` | cell recovery and write buffering |
//! | `fifo` | 16-byte FIFO and DMA/PIO transfer requests |
//! | `drive` | per-drive state |
//!
//! # Timing
//!
//! The controller has no clock of its own. Every host access carries the
//! current time, and the embedder calls [`Upd765::run_until`] whenever
//! [`Upd765::next_event`] falls due. Step pulses, index edges and ready
//! polling are all processed in time order inside `run_until`.
//!
//! # Phases
//!
//! Command (host writes parameter bytes) → Execution (data transfer, or
//! background seek) → Result (host reads status bytes) → Command.

mod commands;
mod config;
mod drive;
mod fifo;
mod live;
mod pll;
mod registers;

use std::cell::RefCell;
use std::rc::Rc;

use emu_core::{Medium, Observable, OutputLine, Time, Value};
use tracing::debug;

pub use commands::calc_sector_size;
pub use config::{Config, ConfigError, Mode, RATES, RegisterMap};
pub use drive::{MainState, SubState};
pub use live::LiveState;
pub use pll::Pll;
pub use registers::{
    FIF_DIS, FIF_EIS, FIF_POLL, FIF_THR, MSR_CB, MSR_DIO, MSR_EXM, MSR_RQM, SPEC_ND, ST0_ABRT, ST0_EC, ST0_FAIL,
    ST0_NR, ST0_SE, ST0_UNIT, ST0_UNK, ST1_DE, ST1_EN, ST1_MA, ST1_ND, ST1_NW, ST1_OR, ST2_BC, ST2_CM, ST2_DD,
    ST2_MD, ST2_SH, ST2_SN, ST2_WC, ST3_RY, ST3_T0, ST3_TS, ST3_WP,
};

use commands::ScanState;
use drive::DriveSlot;
use fifo::Fifo;
use live::LiveInfo;

/// Host protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting command bytes.
    Command,
    /// Transferring data or waiting on the drive.
    Execution,
    /// Result bytes waiting for the host.
    Result,
}

impl Phase {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Phase::Command => "command",
            Phase::Execution => "execution",
            Phase::Result => "result",
        }
    }
}

/// Something `run_until` has to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Timer(usize),
    Index(usize, bool),
    Poll,
}

/// uPD765-family floppy disk controller.
#[derive(Debug)]
pub struct Upd765 {
    config: Config,
    /// Time up to which everything has been processed.
    now: Time,

    phase: Phase,
    command: [u8; 16],
    command_pos: usize,
    result: [u8; 16],
    result_read: usize,
    result_len: usize,

    dor: u8,
    dsr: u8,
    rate: u32,
    spec: u16,
    fifocfg: u8,
    precomp: u8,
    perpmode: u8,
    locked: bool,

    data_irq: bool,
    other_irq: bool,
    /// Non-DMA transfer request, reported through MSR RQM and the interrupt.
    internal_drq: bool,
    irq: OutputLine,
    drq: OutputLine,
    hdl: OutputLine,

    drives: [DriveSlot; 4],
    live: LiveInfo,
    checkpoint_live: LiveInfo,
    fifo: Fifo,

    /// TC input level.
    tc: bool,
    /// TC rose during the current command.
    tc_done: bool,
    st1: u8,
    st2: u8,
    st3: u8,
    mfm: bool,
    sector_size: usize,
    sectors_read: u8,
    scan: ScanState,
    /// READY level used when the drive lines are not wired.
    external_ready: bool,
    poll_at: Time,
}

impl Upd765 {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut fdc = Self {
            now: Time::ZERO,
            phase: Phase::Command,
            command: [0; 16],
            command_pos: 0,
            result: [0; 16],
            result_read: 0,
            result_len: 0,
            dor: config.dor_reset,
            dsr: 0,
            rate: config.default_rate,
            spec: 0,
            fifocfg: FIF_DIS,
            precomp: 0,
            perpmode: 0,
            locked: false,
            data_irq: false,
            other_irq: false,
            internal_drq: false,
            irq: OutputLine::new(),
            drq: OutputLine::new(),
            hdl: OutputLine::new(),
            drives: std::array::from_fn(|_| DriveSlot::new()),
            live: LiveInfo::new(),
            checkpoint_live: LiveInfo::new(),
            fifo: Fifo::new(),
            tc: false,
            tc_done: false,
            st1: 0,
            st2: 0,
            st3: 0,
            mfm: false,
            sector_size: 0,
            sectors_read: 0,
            scan: ScanState::new(),
            external_ready: true,
            poll_at: Time::NEVER,
            config,
        };
        fdc.reset(Time::ZERO);
        fdc
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect a drive. Without drive select lines every unit number
    /// reaches the same drive, so it is attached to all four slots.
    pub fn attach(&mut self, drive: usize, medium: Rc<RefCell<dyn Medium>>, now: Time) {
        self.run_until(now);
        let index = medium.borrow().index(self.now);
        let slots = if self.config.select_connected { drive..drive + 1 } else { 0..4 };
        for slot in &mut self.drives[slots] {
            slot.medium = Some(Rc::clone(&medium));
            slot.index = index;
            slot.index_seen = self.now;
        }
        debug!(drive, at = %self.now, "drive attached");
    }

    pub fn detach(&mut self, drive: usize, now: Time) {
        self.run_until(now);
        let slots = if self.config.select_connected { drive..drive + 1 } else { 0..4 };
        if self.live.drive.is_some_and(|d| slots.contains(&d)) {
            self.live_abort();
        }
        for slot in &mut self.drives[slots] {
            slot.medium = None;
            slot.index = false;
        }
        debug!(drive, at = %self.now, "drive detached");
    }

    /// External READY level, used when the drive READY lines are not wired.
    pub fn set_ready(&mut self, level: bool) {
        self.external_ready = level;
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Earliest pending event no later than `limit`. Ties go to drive
    /// timers, then index edges, then the ready poll.
    fn pending_event(&self, limit: Time) -> Option<(Time, Event)> {
        let mut best: Option<(Time, Event)> = None;
        let mut consider = |at: Time, event: Event| {
            if at <= limit && !at.is_never() && best.is_none_or(|(t, _)| at < t) {
                best = Some((at, event));
            }
        };
        for (unit, drive) in self.drives.iter().enumerate() {
            consider(drive.timer, Event::Timer(unit));
        }
        for (unit, drive) in self.drives.iter().enumerate() {
            if let Some((at, level)) = drive.with_medium(|m| m.next_index_edge(drive.index_seen)).flatten() {
                consider(at, Event::Index(unit, level));
            }
        }
        consider(self.poll_at, Event::Poll);
        best
    }

    /// Time of the next thing the controller needs to process, or
    /// `Time::NEVER`.
    #[must_use]
    pub fn next_event(&self) -> Time {
        self.pending_event(Time(u64::MAX - 1)).map_or(Time::NEVER, |(at, _)| at)
    }

    /// Process everything up to `now`.
    pub fn run_until(&mut self, now: Time) {
        while let Some((at, event)) = self.pending_event(now) {
            self.now = self.now.max(at);
            match event {
                Event::Timer(unit) => {
                    self.drives[unit].timer = Time::NEVER;
                    self.drive_timer(unit);
                }
                Event::Index(unit, level) => {
                    self.drives[unit].index_seen = at;
                    self.index_edge(unit, level);
                }
                Event::Poll => self.ready_poll(),
            }
        }
        self.now = self.now.max(now);
    }

    #[must_use]
    pub fn now(&self) -> Time {
        self.now
    }

    // -----------------------------------------------------------------------
    // Output lines
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn irq(&self) -> bool {
        self.irq.level()
    }

    #[must_use]
    pub fn drq(&self) -> bool {
        self.drq.level()
    }

    /// Head load output.
    #[must_use]
    pub fn hdl(&self) -> bool {
        self.hdl.level()
    }

    pub fn connect_irq(&mut self, handler: impl FnMut(bool) + 'static) {
        self.irq.connect(handler);
    }

    pub fn connect_drq(&mut self, handler: impl FnMut(bool) + 'static) {
        self.drq.connect(handler);
    }

    pub fn connect_hdl(&mut self, handler: impl FnMut(bool) + 'static) {
        self.hdl.connect(handler);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Present cylinder number the controller holds for `drive`.
    #[must_use]
    pub fn pcn(&self, drive: usize) -> u8 {
        self.drives[drive].pcn
    }

    #[must_use]
    pub fn main_state(&self, drive: usize) -> MainState {
        self.drives[drive].main_state
    }

    #[must_use]
    pub fn live_state(&self) -> LiveState {
        self.live.state
    }

    /// Result bytes not yet read by the host.
    #[must_use]
    pub fn pending_result(&self) -> &[u8] {
        &self.result[self.result_read..self.result_len]
    }
}

const QUERY_PATHS: &[&str] = &[
    "phase",
    "msr",
    "st1",
    "st2",
    "st3",
    "fifocfg",
    "rate",
    "irq",
    "drq",
    "hdl",
    "command",
    "live.state",
    "live.drive",
    "drive0.pcn",
    "drive0.state",
    "drive1.pcn",
    "drive1.state",
    "drive2.pcn",
    "drive2.state",
    "drive3.pcn",
    "drive3.state",
];

impl Observable for Upd765 {
    fn query(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("drive") {
            let (unit, field) = rest.split_once('.')?;
            let drive = self.drives.get(unit.parse::<usize>().ok()?)?;
            return match field {
                "pcn" => Some(drive.pcn.into()),
                "state" => Some(drive.main_state.name().into()),
                _ => None,
            };
        }
        match path {
            "phase" => Some(self.phase.name().into()),
            "msr" => Some(self.msr_value().into()),
            "st1" => Some(self.st1.into()),
            "st2" => Some(self.st2.into()),
            "st3" => Some(self.st3.into()),
            "fifocfg" => Some(self.fifocfg.into()),
            "rate" => Some(self.rate.into()),
            "irq" => Some(self.irq.level().into()),
            "drq" => Some(self.drq.level().into()),
            "hdl" => Some(self.hdl.level().into()),
            "command" => Some(self.command[..self.command_pos].into()),
            "live.state" => Some(self.live.state.name().into()),
            "live.drive" => Some(self.live.drive.map_or(0xFF, |d| d as u8).into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        QUERY_PATHS
    }
}
