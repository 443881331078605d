//! Per-drive command state.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use emu_core::{Medium, Time};

/// Command a drive is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    Idle,
    Recalibrate,
    Seek,
    ReadData,
    WriteData,
    ReadTrack,
    FormatTrack,
    ReadId,
    ScanData,
}

/// Step within the running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Idle,
    SeekMove,
    SeekWaitStepSignalTime,
    SeekWaitStepSignalTimeDone,
    SeekWaitStepTime,
    SeekWaitStepTimeDone,
    SeekDone,
    HeadLoadDone,
    WaitIndex,
    WaitIndexDone,
    ScanId,
    ScanIdFailed,
    SectorRead,
    SectorWritten,
    TrackDone,
    CommandDone,
}

impl MainState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            MainState::Idle => "idle",
            MainState::Recalibrate => "recalibrate",
            MainState::Seek => "seek",
            MainState::ReadData => "read_data",
            MainState::WriteData => "write_data",
            MainState::ReadTrack => "read_track",
            MainState::FormatTrack => "format_track",
            MainState::ReadId => "read_id",
            MainState::ScanData => "scan_data",
        }
    }
}

pub(crate) struct DriveSlot {
    pub medium: Option<Rc<RefCell<dyn Medium>>>,
    pub main_state: MainState,
    pub sub_state: SubState,
    /// Present cylinder number as the controller believes it.
    pub pcn: u8,
    /// Cylinder a SEEK is heading for.
    pub seek_target: u8,
    pub st0: u8,
    /// `st0` holds a status not yet collected by SENSE INTERRUPT STATUS.
    pub st0_filled: bool,
    /// Last step direction was outward (toward cylinder 0).
    pub dir_outward: bool,
    /// Recalibrate step budget, or index pulses seen while searching.
    pub counter: u8,
    /// This drive owns the live engine.
    pub live: bool,
    pub index: bool,
    pub ready: bool,
    /// Step timing and live-engine wake-ups. `NEVER` when unarmed.
    pub timer: Time,
    /// Index edges up to this time have been handled.
    pub index_seen: Time,
}

impl DriveSlot {
    pub fn new() -> Self {
        Self {
            medium: None,
            main_state: MainState::Idle,
            sub_state: SubState::Idle,
            pcn: 0,
            seek_target: 0,
            st0: 0,
            st0_filled: false,
            dir_outward: false,
            counter: 0,
            live: false,
            index: false,
            ready: false,
            timer: Time::NEVER,
            index_seen: Time::ZERO,
        }
    }

    pub fn with_medium<R>(&self, f: impl FnOnce(&dyn Medium) -> R) -> Option<R> {
        self.medium.as_ref().map(|m| f(&*m.borrow()))
    }

    pub fn with_medium_mut<R>(&self, f: impl FnOnce(&mut dyn Medium) -> R) -> Option<R> {
        self.medium.as_ref().map(|m| f(&mut *m.borrow_mut()))
    }

    pub fn is_seeking(&self) -> bool {
        matches!(self.main_state, MainState::Recalibrate | MainState::Seek)
    }
}

impl fmt::Debug for DriveSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveSlot")
            .field("attached", &self.medium.is_some())
            .field("main_state", &self.main_state)
            .field("sub_state", &self.sub_state)
            .field("pcn", &self.pcn)
            .field("st0", &self.st0)
            .field("st0_filled", &self.st0_filled)
            .field("live", &self.live)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}
