//! Command decode and execution.
//!
//! Each command has a fixed number of bytes, decided by the low five bits
//! of the first one. Once complete, the command starts; the data commands
//! then advance through per-drive sub-states driven by step timers, index
//! pulses and the live engine.

use emu_core::Time;
use tracing::{debug, warn};

use crate::drive::{MainState, SubState};
use crate::live::LiveState;
use crate::registers::{
    FIF_EIS, FIF_POLL, ST0_ABRT, ST0_EC, ST0_FAIL, ST0_NR, ST0_SE, ST0_UNIT, ST0_UNK, ST1_DE, ST1_EN,
    ST1_MA, ST1_ND, ST1_NW, ST2_BC, ST2_CM, ST2_DD, ST2_MD, ST2_SH, ST2_SN, ST2_WC, ST3_RY, ST3_T0,
    ST3_TS, ST3_WP,
};
use crate::{Phase, Upd765};

/// Command IDs (low 5 bits of the first command byte).
const CMD_READ_TRACK: u8 = 0x02;
const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE: u8 = 0x04;
const CMD_WRITE_DATA: u8 = 0x05;
const CMD_READ_DATA: u8 = 0x06;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT: u8 = 0x08;
const CMD_WRITE_DELETED_DATA: u8 = 0x09;
const CMD_READ_ID: u8 = 0x0A;
const CMD_READ_DELETED_DATA: u8 = 0x0C;
const CMD_FORMAT_TRACK: u8 = 0x0D;
const CMD_DUMPREG: u8 = 0x0E;
const CMD_SEEK: u8 = 0x0F;
const CMD_VERSION: u8 = 0x10;
const CMD_SCAN_EQUAL: u8 = 0x11;
const CMD_PERPENDICULAR: u8 = 0x12;
const CMD_CONFIGURE: u8 = 0x13;
const CMD_LOCK: u8 = 0x14;
const CMD_SCAN_LOW: u8 = 0x19;
const CMD_SCAN_HIGH: u8 = 0x1D;

/// STEP low time before the rising edge.
const STEP_PULSE: Time = Time::from_nanos(2500);
/// Steps RECALIBRATE tries before giving up.
const RECALIBRATE_STEPS: u8 = 77;
/// Index pulses an ID search may span.
const ID_SEARCH_REVOLUTIONS: u8 = 2;
const READY_POLL_PERIOD: Time = Time::from_micros(1024);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    ReadTrack,
    Specify,
    SenseDriveStatus,
    WriteData,
    ReadData,
    Recalibrate,
    SenseInterruptStatus,
    ReadId,
    FormatTrack,
    DumpReg,
    Seek,
    Version,
    Scan,
    Perpendicular,
    Configure,
    Lock,
}

impl Command {
    fn name(self) -> &'static str {
        match self {
            Command::ReadTrack => "read track",
            Command::Specify => "specify",
            Command::SenseDriveStatus => "sense drive status",
            Command::WriteData => "write data",
            Command::ReadData => "read data",
            Command::Recalibrate => "recalibrate",
            Command::SenseInterruptStatus => "sense interrupt status",
            Command::ReadId => "read id",
            Command::FormatTrack => "format track",
            Command::DumpReg => "dumpreg",
            Command::Seek => "seek",
            Command::Version => "version",
            Command::Scan => "scan",
            Command::Perpendicular => "perpendicular mode",
            Command::Configure => "configure",
            Command::Lock => "lock",
        }
    }
}

/// Decode the first command byte: the command and its total length.
/// `None` for opcodes this variant does not implement.
pub(crate) fn decode(opcode: u8, has_version: bool) -> Option<(Command, usize)> {
    let decoded = match opcode & 0x1F {
        CMD_READ_TRACK => (Command::ReadTrack, 9),
        CMD_SPECIFY => (Command::Specify, 3),
        CMD_SENSE_DRIVE => (Command::SenseDriveStatus, 2),
        CMD_WRITE_DATA | CMD_WRITE_DELETED_DATA => (Command::WriteData, 9),
        CMD_READ_DATA | CMD_READ_DELETED_DATA => (Command::ReadData, 9),
        CMD_RECALIBRATE => (Command::Recalibrate, 2),
        CMD_SENSE_INTERRUPT => (Command::SenseInterruptStatus, 1),
        CMD_READ_ID => (Command::ReadId, 2),
        CMD_FORMAT_TRACK => (Command::FormatTrack, 6),
        CMD_DUMPREG => (Command::DumpReg, 1),
        CMD_SEEK => (Command::Seek, 3),
        CMD_VERSION if has_version => (Command::Version, 1),
        CMD_SCAN_EQUAL | CMD_SCAN_LOW | CMD_SCAN_HIGH => (Command::Scan, 9),
        CMD_PERPENDICULAR => (Command::Perpendicular, 2),
        CMD_CONFIGURE => (Command::Configure, 4),
        CMD_LOCK => (Command::Lock, 1),
        _ => return None,
    };
    Some(decoded)
}

/// Sector length for size code `n`.
#[must_use]
pub fn calc_sector_size(n: u8) -> usize {
    if n > 7 { 16384 } else { 128 << n }
}

/// Running comparison for the SCAN commands, one sector at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanState {
    pub all_equal: bool,
    pub satisfied: bool,
}

impl ScanState {
    pub fn new() -> Self {
        Self {
            all_equal: true,
            satisfied: true,
        }
    }
}

impl Upd765 {
    /// A command byte arrived; start the command once it is complete.
    pub(crate) fn dispatch_command(&mut self) {
        let Some((command, length)) = decode(self.command[0], self.config.version.is_some()) else {
            warn!(opcode = self.command[0], "invalid command");
            self.command_pos = 0;
            self.set_result(&[ST0_UNK]);
            return;
        };
        if self.command_pos >= length {
            self.start_command(command, length);
        }
    }

    pub(crate) fn set_result(&mut self, bytes: &[u8]) {
        self.result[..bytes.len()].copy_from_slice(bytes);
        self.result_len = bytes.len();
        self.result_read = 0;
        self.phase = Phase::Result;
    }

    pub(crate) fn get_ready(&self, unit: usize) -> bool {
        if self.config.ready_connected {
            self.drives[unit].with_medium(|m| m.ready()).unwrap_or(false)
        } else {
            self.external_ready
        }
    }

    /// Nominal cell period for the current rate and encoding.
    pub(crate) fn cell_period(&self) -> Time {
        let rate = u64::from(self.rate);
        Time::from_hz(if self.mfm { rate * 2 } else { rate })
    }

    fn step_time(&self) -> Time {
        let srt = u64::from(self.spec >> 12);
        Time::from_cycles(500 * (16 - srt), u64::from(self.rate))
    }

    fn sector_matches(&self) -> bool {
        self.live.idbuf[..4] == self.command[2..6]
    }

    fn start_command(&mut self, command: Command, length: usize) {
        self.command_pos = 0;
        self.result_len = 0;
        self.result_read = 0;
        self.phase = Phase::Execution;
        self.tc_done = false;
        let unit = usize::from(self.command[1] & 3);
        debug!(command = command.name(), bytes = ?&self.command[..length], "command start");

        match command {
            Command::Configure => {
                self.fifocfg = self.command[2];
                self.precomp = self.command[3];
                self.phase = Phase::Command;
            }
            Command::DumpReg => {
                let locked = if self.locked { 0x80 } else { 0x00 };
                let dump = [
                    self.drives[0].pcn,
                    self.drives[1].pcn,
                    self.drives[2].pcn,
                    self.drives[3].pcn,
                    (self.spec >> 8) as u8,
                    self.spec as u8,
                    self.sector_size as u8,
                    locked | (self.perpmode & 0x30),
                    self.fifocfg,
                    self.precomp,
                ];
                self.set_result(&dump);
            }
            Command::FormatTrack => self.format_track_start(unit),
            Command::Lock => {
                self.locked = self.command[0] & 0x80 != 0;
                self.set_result(&[if self.locked { 0x10 } else { 0x00 }]);
            }
            Command::Perpendicular => {
                self.perpmode = self.command[1];
                self.phase = Phase::Command;
            }
            Command::ReadData => self.read_data_start(unit, MainState::ReadData),
            Command::Scan => self.read_data_start(unit, MainState::ScanData),
            Command::ReadId => self.read_id_start(unit),
            Command::ReadTrack => self.read_track_start(unit),
            Command::Recalibrate => {
                self.phase = Phase::Command;
                self.recalibrate_start(unit);
            }
            Command::Seek => {
                self.phase = Phase::Command;
                self.seek_start(unit);
            }
            Command::SenseDriveStatus => {
                let drive = &self.drives[unit];
                let mut st3 = self.command[1] & 7;
                if self.get_ready(unit) {
                    st3 |= ST3_RY;
                }
                drive.with_medium(|m| {
                    if m.write_protected() {
                        st3 |= ST3_WP;
                    }
                    if m.track0() {
                        st3 |= ST3_T0;
                    }
                    if m.two_sided() {
                        st3 |= ST3_TS;
                    }
                });
                self.st3 = st3;
                self.set_result(&[st3]);
            }
            Command::SenseInterruptStatus => self.sense_interrupt_status(),
            Command::Specify => {
                self.spec = u16::from(self.command[1]) << 8 | u16::from(self.command[2]);
                self.phase = Phase::Command;
            }
            Command::Version => {
                let version = self.config.version.unwrap_or(ST0_UNK);
                self.set_result(&[version]);
            }
            Command::WriteData => self.write_data_start(unit),
        }
    }

    /// Report the first drive holding an uncollected status.
    fn sense_interrupt_status(&mut self) {
        let Some(unit) = self.drives.iter().position(|d| d.st0_filled) else {
            self.set_result(&[ST0_UNK]);
            self.other_irq = false;
            self.check_irq();
            return;
        };
        let drive = &mut self.drives[unit];
        drive.st0_filled = false;
        let result = [drive.st0, drive.pcn];
        self.set_result(&result);
        // Other drives keep their interrupt until they are sensed too.
        self.other_irq = self.drives.iter().any(|d| d.st0_filled);
        self.check_irq();
    }

    pub(crate) fn command_end(&mut self, unit: usize, data: bool) {
        debug!(unit, data, result = ?&self.result[..self.result_len], "command done");
        let drive = &mut self.drives[unit];
        drive.main_state = MainState::Idle;
        drive.sub_state = SubState::Idle;
        if data {
            // Bytes the host never collected (TC mid-sector) die with the
            // command.
            self.fifo.clear();
            self.disable_transfer();
            self.data_irq = true;
            self.hdl.set(false);
        } else {
            self.other_irq = true;
            drive.st0_filled = true;
        }
        self.check_irq();
    }

    // -----------------------------------------------------------------------
    // RECALIBRATE / SEEK
    // -----------------------------------------------------------------------

    fn recalibrate_start(&mut self, unit: usize) {
        let ready = self.get_ready(unit);
        let drive = &mut self.drives[unit];
        drive.main_state = MainState::Recalibrate;
        drive.sub_state = SubState::SeekWaitStepTimeDone;
        drive.dir_outward = true;
        drive.counter = RECALIBRATE_STEPS;
        drive.ready = ready;
        drive.st0 = if ready { 0 } else { ST0_NR };
        self.seek_continue(unit);
    }

    fn seek_start(&mut self, unit: usize) {
        let target = self.command[2];
        let ready = self.get_ready(unit);
        let drive = &mut self.drives[unit];
        drive.main_state = MainState::Seek;
        drive.sub_state = SubState::SeekWaitStepTimeDone;
        drive.seek_target = target;
        drive.dir_outward = drive.pcn > target;
        drive.ready = ready;
        drive.st0 = if ready { 0 } else { ST0_NR };
        debug!(unit, from = drive.pcn, to = target, "seek");
        self.seek_continue(unit);
    }

    /// Step pulse, first half: direction and STEP low.
    fn step_begin(&mut self, unit: usize, outward: bool) {
        let now = self.now;
        let drive = &mut self.drives[unit];
        drive.dir_outward = outward;
        drive.with_medium_mut(|m| {
            m.set_direction(outward);
            m.set_step(false);
        });
        drive.sub_state = SubState::SeekWaitStepSignalTime;
        drive.timer = now + STEP_PULSE;
    }

    /// Second half: STEP high moves the head, then wait the step rate.
    fn step_end(&mut self, unit: usize) {
        let wait = self.now + self.step_time();
        let drive = &mut self.drives[unit];
        drive.with_medium_mut(|m| m.set_step(true));
        drive.sub_state = SubState::SeekWaitStepTime;
        drive.timer = wait;
    }

    fn seek_continue(&mut self, unit: usize) {
        loop {
            match self.drives[unit].sub_state {
                SubState::SeekMove => {
                    let outward = self.drives[unit].dir_outward;
                    debug!(unit, pcn = self.drives[unit].pcn, outward, "step");
                    self.step_begin(unit, outward);
                    return;
                }
                SubState::SeekWaitStepSignalTimeDone => {
                    self.step_end(unit);
                    let drive = &mut self.drives[unit];
                    if drive.main_state == MainState::Seek {
                        drive.pcn = if drive.pcn > drive.seek_target {
                            drive.pcn - 1
                        } else {
                            drive.pcn + 1
                        };
                    }
                    return;
                }
                SubState::SeekWaitStepTimeDone => {
                    let drive = &mut self.drives[unit];
                    let done = match drive.main_state {
                        MainState::Recalibrate => {
                            if drive.with_medium(|m| m.track0()).unwrap_or(false) {
                                drive.pcn = 0;
                                true
                            } else {
                                drive.counter -= 1;
                                if drive.counter == 0 {
                                    drive.st0 |= ST0_FAIL | ST0_SE | ST0_EC | unit as u8;
                                    self.command_end(unit, false);
                                    return;
                                }
                                false
                            }
                        }
                        _ => drive.pcn == drive.seek_target,
                    };
                    if done {
                        drive.st0 |= ST0_SE | unit as u8;
                        self.command_end(unit, false);
                        return;
                    }
                    drive.sub_state = SubState::SeekMove;
                }
                _ => return,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Implied seek, shared by READ DATA, SCAN and READ TRACK
    // -----------------------------------------------------------------------

    /// One pass of the implied-seek loop. Returns true when the head is on
    /// the requested cylinder (or implied seek is off).
    fn implied_seek(&mut self, unit: usize) -> bool {
        let target = self.command[2];
        match self.drives[unit].sub_state {
            SubState::HeadLoadDone => {
                let drive = &mut self.drives[unit];
                if drive.pcn == target || self.fifocfg & FIF_EIS == 0 {
                    drive.sub_state = SubState::SeekDone;
                    return true;
                }
                drive.st0 |= ST0_SE;
                let outward = drive.pcn > target;
                self.step_begin(unit, outward);
                false
            }
            SubState::SeekWaitStepSignalTimeDone => {
                self.step_end(unit);
                false
            }
            SubState::SeekWaitStepTimeDone => {
                let drive = &mut self.drives[unit];
                drive.pcn = if drive.pcn > target { drive.pcn - 1 } else { drive.pcn + 1 };
                drive.sub_state = SubState::HeadLoadDone;
                self.implied_seek(unit)
            }
            _ => false,
        }
    }

    /// Shared start of the data commands: status reset, head load, side
    /// select. False when the drive is not ready.
    fn data_command_start(&mut self, unit: usize, main: MainState) -> bool {
        self.mfm = self.command[0] & 0x40 != 0;
        debug!(
            command = main.name(),
            unit,
            chrn = ?&self.command[2..6],
            eot = self.command[6],
            mt = self.command[0] & 0x80 != 0,
            mfm = self.mfm,
            sk = self.command[0] & 0x20 != 0,
            rate = self.rate,
            "data command"
        );
        let ready = self.get_ready(unit);
        let head = (self.command[1] >> 2) & 1;
        let st0 = self.command[1] & 7;
        let drive = &mut self.drives[unit];
        drive.main_state = main;
        drive.sub_state = SubState::HeadLoadDone;
        drive.st0 = st0;
        drive.ready = ready;
        self.st1 = ST1_MA;
        self.st2 = 0;
        self.hdl.set(true);
        if !ready {
            self.drives[unit].st0 |= ST0_NR | ST0_FAIL;
            self.st1 = 0;
            self.st2 = 0;
            return false;
        }
        self.drives[unit].with_medium_mut(|m| m.set_side(head));
        true
    }

    /// End of sector: step R (and the head with MT). True when the command
    /// is finished.
    fn advance_sector(&mut self, unit: usize) -> bool {
        let mut done = self.tc_done;
        if self.command[4] == self.command[6] {
            let multi_track = self.command[0] & 0x80 != 0;
            if multi_track {
                self.command[3] ^= 1;
                self.command[4] = 1;
                let head = self.command[3] & 1;
                self.drives[unit].with_medium_mut(|m| m.set_side(head));
            }
            if !multi_track || self.command[3] & 1 == 0 {
                if self.tc_done {
                    self.command[2] = self.command[2].wrapping_add(1);
                    self.command[4] = 1;
                } else {
                    self.drives[unit].st0 |= ST0_FAIL;
                    self.st1 |= ST1_EN;
                }
                done = true;
            }
        } else {
            self.command[4] = self.command[4].wrapping_add(1);
        }
        done
    }

    fn data_result(&mut self, unit: usize) {
        let result = [
            self.drives[unit].st0,
            self.st1,
            self.st2,
            self.command[2],
            self.command[3],
            self.command[4],
            self.command[5],
        ];
        self.set_result(&result);
        self.command_end(unit, true);
    }

    // -----------------------------------------------------------------------
    // READ DATA / READ DELETED DATA / SCAN
    // -----------------------------------------------------------------------

    fn read_data_start(&mut self, unit: usize, main: MainState) {
        if !self.data_command_start(unit, main) {
            self.drives[unit].sub_state = SubState::CommandDone;
        }
        self.read_data_continue(unit);
    }

    fn read_data_continue(&mut self, unit: usize) {
        loop {
            match self.drives[unit].sub_state {
                SubState::HeadLoadDone
                | SubState::SeekWaitStepSignalTimeDone
                | SubState::SeekWaitStepTimeDone => {
                    if !self.implied_seek(unit) {
                        return;
                    }
                }
                SubState::SeekDone => {
                    self.drives[unit].counter = 0;
                    self.drives[unit].sub_state = SubState::ScanId;
                    self.live_start(unit, LiveState::SearchAddressMarkHeader);
                    return;
                }
                SubState::ScanId => {
                    if self.live.crc != 0 {
                        self.drives[unit].st0 |= ST0_FAIL;
                        self.st1 |= ST1_DE | ST1_ND;
                        self.drives[unit].sub_state = SubState::CommandDone;
                        continue;
                    }
                    self.st1 &= !ST1_MA;
                    if !self.sector_matches() {
                        let cylinder = self.live.idbuf[0];
                        if cylinder != self.command[2] {
                            self.st2 |= if cylinder == 0xFF { ST2_WC | ST2_BC } else { ST2_WC };
                        }
                        self.live_start(unit, LiveState::SearchAddressMarkHeader);
                        return;
                    }
                    debug!(unit, chrn = ?&self.live.idbuf[..4], "reading sector");
                    self.sector_size = calc_sector_size(self.live.idbuf[3]);
                    let scanning = self.drives[unit].main_state == MainState::ScanData;
                    if scanning {
                        self.scan = ScanState::new();
                    }
                    self.fifo_expect(self.sector_size, scanning);
                    self.drives[unit].sub_state = SubState::SectorRead;
                    self.live_start(unit, LiveState::SearchAddressMarkData);
                    return;
                }
                SubState::ScanIdFailed => {
                    self.drives[unit].st0 |= ST0_FAIL;
                    self.st1 |= ST1_ND;
                    self.drives[unit].sub_state = SubState::CommandDone;
                }
                SubState::SectorRead => {
                    self.drives[unit].sub_state = self.sector_read(unit);
                }
                SubState::CommandDone => {
                    self.data_result(unit);
                    return;
                }
                _ => return,
            }
        }
    }

    /// A data field has been read: decide the next sub-state.
    fn sector_read(&mut self, unit: usize) -> SubState {
        if self.st2 & ST2_MD != 0 {
            self.drives[unit].st0 |= ST0_FAIL;
            return SubState::CommandDone;
        }
        if !self.live.skip {
            if self.live.crc != 0 {
                self.drives[unit].st0 |= ST0_FAIL;
                self.st1 |= ST1_DE;
                self.st2 |= ST2_DD;
                return SubState::CommandDone;
            }
            let wants_deleted = self.command[0] & 0x1F == CMD_READ_DELETED_DATA;
            if self.live.deleted != wants_deleted {
                // Without SK the odd sector is transferred and ends the command.
                self.st2 |= ST2_CM;
                return SubState::CommandDone;
            }
            if self.drives[unit].main_state == MainState::ScanData {
                return self.scan_sector_done();
            }
        }
        if self.advance_sector(unit) {
            SubState::CommandDone
        } else {
            SubState::SeekDone
        }
    }

    fn scan_sector_done(&mut self) -> SubState {
        if self.scan.satisfied {
            if self.scan.all_equal {
                self.st2 |= ST2_SH;
            }
            return SubState::CommandDone;
        }
        if self.command[4] == self.command[6] {
            self.st2 |= ST2_SN;
            return SubState::CommandDone;
        }
        if self.tc_done {
            return SubState::CommandDone;
        }
        self.command[4] = self.command[4].wrapping_add(self.command[8].max(1));
        SubState::SeekDone
    }

    /// Compare one disk byte against the host's. 0xFF from the host matches
    /// anything.
    pub(crate) fn scan_compare(&mut self, host: u8, disk: u8) {
        if host == 0xFF {
            return;
        }
        if host != disk {
            self.scan.all_equal = false;
        }
        let ok = match self.command[0] & 0x1F {
            CMD_SCAN_LOW => disk <= host,
            CMD_SCAN_HIGH => disk >= host,
            _ => disk == host,
        };
        if !ok {
            self.scan.satisfied = false;
        }
    }

    // -----------------------------------------------------------------------
    // WRITE DATA / WRITE DELETED DATA
    // -----------------------------------------------------------------------

    fn write_data_start(&mut self, unit: usize) {
        if !self.data_command_start(unit, MainState::WriteData) {
            self.drives[unit].sub_state = SubState::CommandDone;
        } else if self.drives[unit].with_medium(|m| m.write_protected()).unwrap_or(false) {
            debug!(unit, "write protected");
            self.drives[unit].st0 |= ST0_FAIL;
            self.st1 = ST1_NW;
            self.drives[unit].sub_state = SubState::CommandDone;
        }
        self.write_data_continue(unit);
    }

    fn write_data_continue(&mut self, unit: usize) {
        loop {
            match self.drives[unit].sub_state {
                SubState::HeadLoadDone => {
                    self.drives[unit].counter = 0;
                    self.drives[unit].sub_state = SubState::ScanId;
                    self.live_start(unit, LiveState::SearchAddressMarkHeader);
                    return;
                }
                SubState::ScanId => {
                    if !self.sector_matches() {
                        self.live_start(unit, LiveState::SearchAddressMarkHeader);
                        return;
                    }
                    if self.live.crc != 0 {
                        self.drives[unit].st0 |= ST0_FAIL;
                        self.st1 |= ST1_DE | ST1_ND;
                        self.drives[unit].sub_state = SubState::CommandDone;
                        continue;
                    }
                    self.st1 &= !ST1_MA;
                    debug!(unit, chrn = ?&self.live.idbuf[..4], "writing sector");
                    self.sector_size = calc_sector_size(self.live.idbuf[3]);
                    self.fifo_expect(self.sector_size, true);
                    self.drives[unit].sub_state = SubState::SectorWritten;
                    self.live_start(unit, LiveState::WriteSectorSkipGap2);
                    return;
                }
                SubState::ScanIdFailed => {
                    self.drives[unit].st0 |= ST0_FAIL;
                    self.st1 |= ST1_ND;
                    self.drives[unit].sub_state = SubState::CommandDone;
                }
                SubState::SectorWritten => {
                    self.drives[unit].sub_state = if self.advance_sector(unit) {
                        SubState::CommandDone
                    } else {
                        SubState::HeadLoadDone
                    };
                }
                SubState::CommandDone => {
                    self.data_result(unit);
                    return;
                }
                _ => return,
            }
        }
    }

    // -----------------------------------------------------------------------
    // READ TRACK
    // -----------------------------------------------------------------------

    fn read_track_start(&mut self, unit: usize) {
        self.sectors_read = 0;
        if !self.data_command_start(unit, MainState::ReadTrack) {
            self.drives[unit].sub_state = SubState::CommandDone;
        }
        self.read_track_continue(unit);
    }

    fn read_track_continue(&mut self, unit: usize) {
        loop {
            match self.drives[unit].sub_state {
                SubState::HeadLoadDone
                | SubState::SeekWaitStepSignalTimeDone
                | SubState::SeekWaitStepTimeDone => {
                    if !self.implied_seek(unit) {
                        return;
                    }
                }
                SubState::SeekDone => {
                    self.drives[unit].counter = 0;
                    self.drives[unit].sub_state = SubState::WaitIndex;
                    return;
                }
                SubState::WaitIndexDone => {
                    debug!(unit, "index found, reading track");
                    self.drives[unit].sub_state = SubState::ScanId;
                    self.live_start(unit, LiveState::SearchAddressMarkHeader);
                    return;
                }
                SubState::ScanId => {
                    if self.live.crc != 0 {
                        self.st1 |= ST1_DE;
                    }
                    self.st1 &= !ST1_MA;
                    if self.sector_matches() {
                        self.st1 &= !ST1_ND;
                    } else {
                        self.st1 |= ST1_ND;
                    }
                    debug!(unit, chrn = ?&self.live.idbuf[..4], "reading sector");
                    self.sector_size = calc_sector_size(self.live.idbuf[3]);
                    self.fifo_expect(self.sector_size, false);
                    self.drives[unit].sub_state = SubState::SectorRead;
                    self.live_start(unit, LiveState::SearchAddressMarkData);
                    return;
                }
                SubState::ScanIdFailed => {
                    self.drives[unit].st0 |= ST0_FAIL;
                    self.st1 |= ST1_ND;
                    self.drives[unit].sub_state = SubState::CommandDone;
                }
                SubState::SectorRead => {
                    if self.st2 & ST2_MD != 0 {
                        self.drives[unit].st0 |= ST0_FAIL;
                        self.drives[unit].sub_state = SubState::CommandDone;
                        continue;
                    }
                    if self.live.crc != 0 {
                        self.st1 |= ST1_DE;
                        self.st2 |= ST2_DD;
                    }
                    self.sectors_read = self.sectors_read.wrapping_add(1);
                    let mut done = self.tc_done;
                    if self.sectors_read == self.command[6] {
                        if !self.tc_done {
                            self.drives[unit].st0 |= ST0_FAIL;
                            self.st1 |= ST1_EN;
                        }
                        done = true;
                    }
                    self.drives[unit].sub_state = if done {
                        SubState::CommandDone
                    } else {
                        SubState::WaitIndexDone
                    };
                }
                SubState::CommandDone => {
                    self.data_result(unit);
                    return;
                }
                _ => return,
            }
        }
    }

    // -----------------------------------------------------------------------
    // FORMAT TRACK
    // -----------------------------------------------------------------------

    fn format_track_start(&mut self, unit: usize) {
        self.mfm = self.command[0] & 0x40 != 0;
        debug!(
            unit,
            n = self.command[2],
            sectors = self.command[3],
            gpl = self.command[4],
            filler = self.command[5],
            mfm = self.mfm,
            "format track"
        );
        let ready = self.get_ready(unit);
        let head = (self.command[1] >> 2) & 1;
        let st0 = self.command[1] & 7;
        self.st1 = 0;
        self.st2 = 0;
        self.hdl.set(true);
        let drive = &mut self.drives[unit];
        drive.main_state = MainState::FormatTrack;
        drive.sub_state = SubState::HeadLoadDone;
        drive.ready = ready;
        drive.st0 = st0;
        if !ready {
            drive.st0 |= ST0_NR | ST0_FAIL;
            drive.sub_state = SubState::TrackDone;
        } else if drive.with_medium(|m| m.write_protected()).unwrap_or(false) {
            drive.st0 |= ST0_FAIL;
            self.st1 = ST1_NW;
            drive.sub_state = SubState::TrackDone;
        } else {
            drive.with_medium_mut(|m| m.set_side(head));
            self.sector_size = calc_sector_size(self.command[2]);
        }
        self.format_track_continue(unit);
    }

    fn format_track_continue(&mut self, unit: usize) {
        loop {
            match self.drives[unit].sub_state {
                SubState::HeadLoadDone => {
                    self.drives[unit].sub_state = SubState::WaitIndex;
                }
                SubState::WaitIndexDone => {
                    debug!(unit, "index found, writing track");
                    self.drives[unit].sub_state = SubState::TrackDone;
                    self.live_start(unit, LiveState::WriteTrackPreSectors);
                    return;
                }
                SubState::TrackDone => {
                    let result = [self.drives[unit].st0, self.st1, self.st2, 0, 0, 0, self.command[2]];
                    self.set_result(&result);
                    self.command_end(unit, true);
                    return;
                }
                _ => return,
            }
        }
    }

    // -----------------------------------------------------------------------
    // READ ID
    // -----------------------------------------------------------------------

    fn read_id_start(&mut self, unit: usize) {
        self.mfm = self.command[0] & 0x40 != 0;
        debug!(unit, mfm = self.mfm, "read id");
        let ready = self.get_ready(unit);
        let head = (self.command[1] >> 2) & 1;
        self.st1 = 0;
        self.st2 = 0;
        self.live.idbuf[..4].fill(0);
        self.hdl.set(true);
        let drive = &mut self.drives[unit];
        drive.main_state = MainState::ReadId;
        drive.sub_state = SubState::HeadLoadDone;
        drive.st0 = self.command[1] & 7;
        drive.ready = ready;
        drive.with_medium_mut(|m| m.set_side(head));
        if !ready {
            drive.st0 |= ST0_NR | ST0_FAIL;
            drive.sub_state = SubState::CommandDone;
        }
        self.read_id_continue(unit);
    }

    fn read_id_continue(&mut self, unit: usize) {
        loop {
            match self.drives[unit].sub_state {
                SubState::HeadLoadDone => {
                    self.drives[unit].counter = 0;
                    self.drives[unit].sub_state = SubState::ScanId;
                    self.live_start(unit, LiveState::SearchAddressMarkHeader);
                    return;
                }
                SubState::ScanId => {
                    if self.live.crc != 0 {
                        self.drives[unit].st0 |= ST0_FAIL;
                        self.st1 |= ST1_MA | ST1_DE | ST1_ND;
                    }
                    self.drives[unit].sub_state = SubState::CommandDone;
                }
                SubState::ScanIdFailed => {
                    self.drives[unit].st0 |= ST0_FAIL;
                    self.st1 |= ST1_ND | ST1_MA;
                    self.drives[unit].sub_state = SubState::CommandDone;
                }
                SubState::CommandDone => {
                    let id = self.live.idbuf;
                    let result = [self.drives[unit].st0, self.st1, self.st2, id[0], id[1], id[2], id[3]];
                    self.set_result(&result);
                    self.command_end(unit, true);
                    return;
                }
                _ => return,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Resume whatever `unit` is doing.
    pub(crate) fn general_continue(&mut self, unit: usize) {
        if self.live.state != LiveState::Idle && self.live.drive == Some(unit) {
            self.live_run(None);
            if self.live.state != LiveState::Idle {
                return;
            }
        }
        match self.drives[unit].main_state {
            MainState::Idle => {}
            MainState::Recalibrate | MainState::Seek => self.seek_continue(unit),
            MainState::ReadData | MainState::ScanData => self.read_data_continue(unit),
            MainState::WriteData => self.write_data_continue(unit),
            MainState::ReadTrack => self.read_track_continue(unit),
            MainState::FormatTrack => self.format_track_continue(unit),
            MainState::ReadId => self.read_id_continue(unit),
        }
    }

    /// Per-drive timer expiry: step timing or a live-engine wake-up.
    pub(crate) fn drive_timer(&mut self, unit: usize) {
        self.live_sync();
        let drive = &mut self.drives[unit];
        drive.sub_state = match drive.sub_state {
            SubState::SeekWaitStepSignalTime => SubState::SeekWaitStepSignalTimeDone,
            SubState::SeekWaitStepTime => SubState::SeekWaitStepTimeDone,
            other => other,
        };
        self.general_continue(unit);
    }

    pub(crate) fn index_edge(&mut self, unit: usize, level: bool) {
        if self.drives[unit].live {
            self.live_sync();
        }
        self.drives[unit].index = level;
        if level {
            match self.drives[unit].sub_state {
                SubState::WaitIndex => self.drives[unit].sub_state = SubState::WaitIndexDone,
                SubState::ScanId => {
                    let drive = &mut self.drives[unit];
                    drive.counter += 1;
                    debug!(unit, count = drive.counter, "index during ID search");
                    if drive.counter == ID_SEARCH_REVOLUTIONS {
                        drive.sub_state = SubState::ScanIdFailed;
                        self.live_abort();
                    }
                }
                SubState::TrackDone => self.live_abort(),
                _ => {}
            }
        }
        self.general_continue(unit);
    }

    /// Rising edge of TC ends the transfer after the current sector.
    pub fn set_tc(&mut self, level: bool, now: Time) {
        self.run_until(now);
        let rising = level && !self.tc;
        self.tc = level;
        if rising {
            self.live_sync();
            self.tc_done = true;
            debug!(at = %self.now, "terminal count");
            if let Some(unit) = self.live.drive {
                self.general_continue(unit);
            }
        }
    }

    pub(crate) fn ready_poll(&mut self) {
        self.poll_at = self.now + READY_POLL_PERIOD;
        if self.phase != Phase::Command || self.fifocfg & FIF_POLL != 0 || self.command_pos != 0 {
            return;
        }
        for unit in 0..self.drives.len() {
            let ready = self.get_ready(unit);
            let drive = &mut self.drives[unit];
            if ready != drive.ready {
                debug!(unit, ready, "ready changed");
                drive.ready = ready;
                if !drive.st0_filled {
                    drive.st0 = ST0_ABRT | (unit as u8 & ST0_UNIT);
                    drive.st0_filled = true;
                    self.other_irq = true;
                }
            }
        }
        self.check_irq();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    const T: Time = Time::from_micros(1);

    fn send(fdc: &mut Upd765, bytes: &[u8]) {
        for &b in bytes {
            fdc.write_data(b, T);
        }
    }

    fn results(fdc: &mut Upd765) -> Vec<u8> {
        let mut out = Vec::new();
        while fdc.phase() == Phase::Result {
            out.push(fdc.read_data(T));
        }
        out
    }

    #[test]
    fn command_lengths() {
        assert_eq!(decode(0x46, false), Some((Command::ReadData, 9)));
        assert_eq!(decode(0x4C, false), Some((Command::ReadData, 9)), "read deleted");
        assert_eq!(decode(0x49, false), Some((Command::WriteData, 9)), "write deleted");
        assert_eq!(decode(0x4D, false), Some((Command::FormatTrack, 6)));
        assert_eq!(decode(0xCD, false), Some((Command::FormatTrack, 6)), "only five bits decode");
        assert_eq!(decode(0x08, false), Some((Command::SenseInterruptStatus, 1)));
        assert_eq!(decode(0x13, false), Some((Command::Configure, 4)));
        assert_eq!(decode(0x10, false), None, "VERSION needs a version byte");
        assert_eq!(decode(0x10, true), Some((Command::Version, 1)));
        assert_eq!(decode(0x1F, true), None);
    }

    #[test]
    fn sector_sizes() {
        assert_eq!(calc_sector_size(0), 128);
        assert_eq!(calc_sector_size(2), 512);
        assert_eq!(calc_sector_size(7), 16384);
        assert_eq!(calc_sector_size(0xFF), 16384);
    }

    #[test]
    fn specify_configure_lock_show_in_dumpreg() {
        let mut fdc = Upd765::new(Config::default());
        send(&mut fdc, &[0x03, 0xDF, 0x03]);
        assert_eq!(fdc.phase(), Phase::Command, "SPECIFY has no result phase");
        send(&mut fdc, &[0x13, 0x00, 0x57, 0x12]);
        send(&mut fdc, &[0x12, 0x30]);
        send(&mut fdc, &[0x94]);
        assert_eq!(results(&mut fdc), vec![0x10], "locked");
        send(&mut fdc, &[0x0E]);
        let dump = results(&mut fdc);
        assert_eq!(dump.len(), 10);
        assert_eq!(&dump[4..6], &[0xDF, 0x03]);
        assert_eq!(dump[7], 0x80 | 0x30, "lock and perpendicular bits");
        assert_eq!((dump[8], dump[9]), (0x57, 0x12));
    }

    #[test]
    fn version_answers_per_variant() {
        let mut fdc = Upd765::new(Config::n82077aa());
        fdc.write_register(2, 0x0C, T);
        fdc.write_register(5, 0x10, T);
        assert_eq!(fdc.read_register(5, T), 0x90);

        let mut old = Upd765::new(Config::upd765a());
        send(&mut old, &[0x10]);
        assert_eq!(results(&mut old), vec![ST0_UNK]);
    }

    #[test]
    fn sense_interrupt_without_pending_status() {
        let mut fdc = Upd765::new(Config::pc_fdc_superio());
        fdc.write_register(2, 0x0C, T);
        fdc.write_register(5, 0x08, T);
        assert_eq!(fdc.read_register(5, T), ST0_UNK);
        assert_eq!(fdc.phase(), Phase::Command);
    }

    #[test]
    fn sense_interrupt_reports_drives_in_order() {
        let mut fdc = Upd765::new(Config::pc_fdc_superio());
        fdc.write_register(2, 0x0C, T);
        fdc.drives[1].st0 = 0x21;
        fdc.drives[1].pcn = 7;
        fdc.drives[1].st0_filled = true;
        fdc.drives[3].st0 = 0x23;
        fdc.drives[3].st0_filled = true;
        fdc.other_irq = true;
        fdc.check_irq();

        fdc.write_register(5, 0x08, T);
        assert_eq!(fdc.read_register(5, T), 0x21);
        assert_eq!(fdc.read_register(5, T), 7);
        assert!(fdc.irq(), "drive 3 still pending");
        fdc.write_register(5, 0x08, T);
        assert_eq!(fdc.read_register(5, T), 0x23);
        fdc.read_register(5, T);
        assert!(!fdc.irq());
    }

    #[test]
    fn seek_without_drive_steps_on_the_timer() {
        let mut fdc = Upd765::new(Config::pc_fdc_superio());
        fdc.write_register(2, 0x0C, T);
        fdc.write_register(7, 0x02, T);
        send(&mut fdc, &[0x03, 0xF0, 0x00]);
        send(&mut fdc, &[0x0F, 0x00, 3]);
        assert_eq!(fdc.read_msr(T) & 0x01, 0x01, "drive 0 busy");
        // SRT=F at 250 kbit/s: 500 cycles = 2 ms per step.
        let end = T + Time::from_millis(10);
        fdc.run_until(end);
        assert_eq!(fdc.pcn(0), 3);
        assert!(fdc.irq());
        send(&mut fdc, &[0x08]);
        assert_eq!(results(&mut fdc), vec![ST0_SE, 3]);
    }

    #[test]
    fn recalibrate_without_track0_gives_up() {
        let mut fdc = Upd765::new(Config::pc_fdc_superio());
        fdc.write_register(2, 0x0C, T);
        send(&mut fdc, &[0x03, 0xF0, 0x00]);
        send(&mut fdc, &[0x07, 0x01]);
        fdc.run_until(Time::from_millis(500));
        send(&mut fdc, &[0x08]);
        let result = results(&mut fdc);
        assert_eq!(result[0], ST0_FAIL | ST0_SE | ST0_EC | 1);
    }

    #[test]
    fn scan_compare_modes() {
        let mut fdc = Upd765::new(Config::default());
        fdc.command[0] = CMD_SCAN_LOW;
        fdc.scan = ScanState::new();
        fdc.scan_compare(0x10, 0x08);
        assert!(fdc.scan.satisfied && !fdc.scan.all_equal);
        fdc.scan_compare(0x10, 0x11);
        assert!(!fdc.scan.satisfied);

        fdc.command[0] = CMD_SCAN_EQUAL;
        fdc.scan = ScanState::new();
        fdc.scan_compare(0xFF, 0x42);
        fdc.scan_compare(0x42, 0x42);
        assert_eq!(fdc.scan, ScanState::new(), "wildcard and equal byte");
    }

    #[test]
    fn data_command_without_ready_drive_fails_at_once() {
        let mut fdc = Upd765::new(Config::default());
        send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 2, 9, 0x2A, 0xFF]);
        assert_eq!(fdc.phase(), Phase::Result);
        let result = results(&mut fdc);
        assert_eq!(result[0], ST0_NR | ST0_FAIL);
        assert_eq!(&result[1..3], &[0, 0]);
        assert_eq!(&result[3..], &[0, 0, 1, 2]);
    }
}
