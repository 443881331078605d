//! Live bitstream engine.
//!
//! The engine decodes (or encodes) the track under the head of one drive,
//! a cell at a time, running ahead of real time up to a limit (normally the
//! next index pulse). Everything it does while ahead is tentative: the
//! context is snapshotted at real-time points, and when something outside
//! happens (a host access, TC, an index pulse) before the engine's cursor,
//! the snapshot is restored and the run replayed up to the present.
//!
//! States that touch the FIFO, the status registers or the medium are only
//! entered through [`Upd765::live_delay`], which defers them until real
//! time catches up with the engine cursor.
//!
//! # Field layout (MFM / FM)
//!
//! | Field | MFM | FM |
//! |---|---|---|
//! | address mark sync | 12×00, 3× raw `4489` | 6×00 |
//! | ID mark | FE | raw `F57E` |
//! | data mark | FB (F8 deleted) | raw `F56F` (`F56A` deleted) |
//! | gap 2 | 22×4E | 11×FF |
//! | gap 3 | GPL×4E | GPL×FF |

use std::cell::RefCell;
use std::rc::Rc;

use emu_core::{Medium, Time};
use tracing::{debug, trace};

use crate::Upd765;
use crate::drive::MainState;
use crate::pll::Pll;
use crate::registers::{ST1_MA, ST2_MD};

const MFM_SYNC: u16 = 0x4489;
const MFM_INDEX_SYNC: u16 = 0x5224;
const FM_INDEX_MARK: u16 = 0xF77A;
const FM_ID_MARK: u16 = 0xF57E;
const FM_DATA_MARK: u16 = 0xF56F;
const FM_DELETED_MARK: u16 = 0xF56A;

/// CRC after one A1 sync byte.
const CRC_AFTER_A1: u16 = 0x443B;
/// CRC after three A1 sync bytes.
const CRC_AFTER_SYNC: u16 = 0xCDB4;
const CRC_FM_ID: u16 = 0xEF21;
const CRC_FM_DATA: u16 = 0xBF84;
const CRC_FM_DELETED: u16 = 0x8FE7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Idle,
    SearchAddressMarkHeader,
    ReadHeaderBlockHeader,
    ReadIdBlock,
    SearchAddressMarkData,
    ReadDataBlockHeader,
    SearchAddressMarkDataFailed,
    ReadSectorData,
    ReadSectorDataByte,
    ScanSectorDataByte,
    WriteSectorSkipGap2,
    WriteSectorSkipGap2Byte,
    WriteSectorData,
    WriteSectorDataByte,
    WriteTrackPreSectors,
    WriteTrackPreSectorsByte,
    WriteTrackSector,
    WriteTrackSectorByte,
    WriteTrackPostSectors,
    WriteTrackPostSectorsByte,
}

impl LiveState {
    /// State that produces the next byte once a byte-level write state has
    /// shifted its 16 cells out.
    fn byte_parent(self) -> Option<Self> {
        match self {
            LiveState::WriteSectorDataByte => Some(LiveState::WriteSectorData),
            LiveState::WriteTrackPreSectorsByte => Some(LiveState::WriteTrackPreSectors),
            LiveState::WriteTrackSectorByte => Some(LiveState::WriteTrackSector),
            LiveState::WriteTrackPostSectorsByte => Some(LiveState::WriteTrackPostSectors),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            LiveState::Idle => "idle",
            LiveState::SearchAddressMarkHeader => "search_address_mark_header",
            LiveState::ReadHeaderBlockHeader => "read_header_block_header",
            LiveState::ReadIdBlock => "read_id_block",
            LiveState::SearchAddressMarkData => "search_address_mark_data",
            LiveState::ReadDataBlockHeader => "read_data_block_header",
            LiveState::SearchAddressMarkDataFailed => "search_address_mark_data_failed",
            LiveState::ReadSectorData => "read_sector_data",
            LiveState::ReadSectorDataByte => "read_sector_data_byte",
            LiveState::ScanSectorDataByte => "scan_sector_data_byte",
            LiveState::WriteSectorSkipGap2 => "write_sector_skip_gap2",
            LiveState::WriteSectorSkipGap2Byte => "write_sector_skip_gap2_byte",
            LiveState::WriteSectorData => "write_sector_data",
            LiveState::WriteSectorDataByte => "write_sector_data_byte",
            LiveState::WriteTrackPreSectors => "write_track_pre_sectors",
            LiveState::WriteTrackPreSectorsByte => "write_track_pre_sectors_byte",
            LiveState::WriteTrackSector => "write_track_sector",
            LiveState::WriteTrackSectorByte => "write_track_sector_byte",
            LiveState::WriteTrackPostSectors => "write_track_post_sectors",
            LiveState::WriteTrackPostSectorsByte => "write_track_post_sectors_byte",
        }
    }
}

/// Resumable engine context. A second copy is the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LiveInfo {
    /// Engine cursor. `NEVER` when nothing is running.
    pub tm: Time,
    pub state: LiveState,
    /// Deferred transition waiting for real time to reach `tm`.
    pub next_state: Option<LiveState>,
    pub drive: Option<usize>,
    pub shift_reg: u16,
    pub crc: u16,
    pub bit_counter: u32,
    pub byte_counter: u32,
    /// Next recovered cell is a data cell (not a clock cell).
    pub data_separator_phase: bool,
    pub data_reg: u8,
    /// Last data bit written, for the MFM clock rule.
    pub data_bit_context: bool,
    /// C H R N and the two CRC bytes of the last ID field.
    pub idbuf: [u8; 6],
    pub pll: Pll,
    /// Current data field has a deleted data mark.
    pub deleted: bool,
    /// Current data field is read but not transferred (SK).
    pub skip: bool,
}

impl LiveInfo {
    pub fn new() -> Self {
        Self {
            tm: Time::NEVER,
            state: LiveState::Idle,
            next_state: None,
            drive: None,
            shift_reg: 0,
            crc: 0xFFFF,
            bit_counter: 0,
            byte_counter: 0,
            data_separator_phase: false,
            data_reg: 0,
            data_bit_context: false,
            idbuf: [0; 6],
            pll: Pll::new(),
            deleted: false,
            skip: false,
        }
    }
}

fn crc_step(crc: u16, bit: bool) -> u16 {
    if (crc & 0x8000 != 0) ^ bit {
        (crc << 1) ^ 0x1021
    } else {
        crc << 1
    }
}

type SharedMedium = Option<Rc<RefCell<dyn Medium>>>;

impl Upd765 {
    fn live_medium(&self) -> SharedMedium {
        self.live.drive.and_then(|d| self.drives[d].medium.clone())
    }

    /// Flush pending write cells up to the engine cursor.
    fn live_commit(&mut self) {
        let medium = self.live_medium();
        let mut guard = medium.as_ref().map(|m| m.borrow_mut());
        let target: Option<&mut dyn Medium> = match guard.as_mut() {
            Some(g) => Some(&mut **g),
            None => None,
        };
        let tm = self.live.tm;
        self.live.pll.commit(target, tm);
    }

    fn live_stop_writing(&mut self) {
        let medium = self.live_medium();
        let mut guard = medium.as_ref().map(|m| m.borrow_mut());
        let target: Option<&mut dyn Medium> = match guard.as_mut() {
            Some(g) => Some(&mut **g),
            None => None,
        };
        let tm = self.live.tm;
        self.live.pll.stop_writing(target, tm);
    }

    fn live_release(&mut self) {
        if let Some(drive) = self.live.drive.take() {
            self.drives[drive].live = false;
        }
        self.live.tm = Time::NEVER;
        self.live.state = LiveState::Idle;
    }

    /// Start the engine on `drive` at the current time.
    pub(crate) fn live_start(&mut self, drive: usize, state: LiveState) {
        if let Some(previous) = self.live.drive.filter(|&d| d != drive) {
            self.drives[previous].live = false;
        }
        let idbuf = self.live.idbuf;
        let mut pll = std::mem::take(&mut self.live.pll);
        pll.reset(self.now);
        pll.set_clock(self.cell_period());
        self.live = LiveInfo {
            tm: self.now,
            state,
            drive: Some(drive),
            idbuf,
            pll,
            ..LiveInfo::new()
        };
        self.checkpoint_live = self.live.clone();
        self.drives[drive].live = true;
        trace!(drive, state = state.name(), at = %self.now, "live start");
        self.live_run(None);
    }

    pub(crate) fn checkpoint(&mut self) {
        if self.live.drive.is_some() {
            self.live_commit();
        }
        self.checkpoint_live = self.live.clone();
    }

    pub(crate) fn rollback(&mut self) {
        self.live = self.checkpoint_live.clone();
    }

    /// Defer a transition until real time reaches the engine cursor.
    pub(crate) fn live_delay(&mut self, state: LiveState) {
        self.live.next_state = Some(state);
        if self.live.tm > self.now {
            if let Some(drive) = self.live.drive {
                self.drives[drive].timer = self.live.tm;
            }
        } else {
            self.live_sync();
        }
    }

    /// Bring the engine to the current time: replay up to now if it ran
    /// ahead, or apply the pending transition if now has caught up.
    pub(crate) fn live_sync(&mut self) {
        if self.live.tm.is_never() {
            return;
        }
        if self.live.tm > self.now {
            self.rollback();
            self.live_run(Some(self.now));
            self.live_commit();
        } else {
            self.live_commit();
            if let Some(next) = self.live.next_state.take() {
                trace!(state = next.name(), at = %self.live.tm, "live transition");
                self.live.state = next;
            }
            if self.live.state == LiveState::Idle {
                self.live_stop_writing();
                self.live_release();
            }
        }
        self.live.next_state = None;
        self.checkpoint();
    }

    /// Stop the engine, keeping whatever was done up to now.
    pub(crate) fn live_abort(&mut self) {
        if !self.live.tm.is_never() && self.live.tm > self.now {
            self.rollback();
            self.live_run(Some(self.now));
        }
        if self.live.drive.is_some() {
            self.live_stop_writing();
        }
        self.live_release();
        self.live.next_state = None;
        trace!(at = %self.now, "live abort");
    }

    /// Run the engine up to `limit` (default: the drive's next index pulse)
    /// or until it needs real time to catch up.
    pub(crate) fn live_run(&mut self, limit: Option<Time>) {
        if self.live.state == LiveState::Idle || self.live.next_state.is_some() {
            return;
        }
        let Some(drive) = self.live.drive else {
            return;
        };
        let limit = match limit {
            Some(limit) => limit,
            None => {
                let now = self.now;
                match self.drives[drive].with_medium(|m| m.next_index(now)).flatten() {
                    Some(index) => index,
                    None => {
                        // No index without a turning disk: wake up every
                        // millisecond instead of searching forever.
                        let wake = now + Time::from_millis(1);
                        self.drives[drive].timer = wake;
                        wake
                    }
                }
            }
        };
        let medium = self.live_medium();

        loop {
            match self.live.state {
                LiveState::Idle => return,

                LiveState::SearchAddressMarkHeader => {
                    if self.read_one_bit(medium.as_ref(), limit) {
                        return;
                    }
                    let shift = self.live.shift_reg;
                    if self.mfm && shift == MFM_SYNC {
                        self.live.crc = CRC_AFTER_A1;
                        self.live.data_separator_phase = false;
                        self.live.bit_counter = 0;
                        self.live.state = LiveState::ReadHeaderBlockHeader;
                    }
                    if !self.mfm && shift == FM_ID_MARK {
                        self.live.crc = CRC_FM_ID;
                        self.live.data_separator_phase = false;
                        self.live.bit_counter = 0;
                        self.live.state = LiveState::ReadIdBlock;
                    }
                }

                LiveState::ReadHeaderBlockHeader => {
                    if self.read_one_bit(medium.as_ref(), limit) {
                        return;
                    }
                    if self.live.bit_counter & 15 != 0 {
                        continue;
                    }
                    let slot = self.live.bit_counter >> 4;
                    if slot < 3 {
                        if self.live.shift_reg != MFM_SYNC {
                            self.live.state = LiveState::SearchAddressMarkHeader;
                        }
                        continue;
                    }
                    if self.live.data_reg != 0xFE {
                        self.live.state = LiveState::SearchAddressMarkHeader;
                        continue;
                    }
                    self.live.bit_counter = 0;
                    self.live.state = LiveState::ReadIdBlock;
                }

                LiveState::ReadIdBlock => {
                    if self.read_one_bit(medium.as_ref(), limit) {
                        return;
                    }
                    if self.live.bit_counter & 15 != 0 {
                        continue;
                    }
                    let slot = (self.live.bit_counter >> 4) as usize - 1;
                    self.live.idbuf[slot] = self.live.data_reg;
                    if slot == 5 {
                        self.live_delay(LiveState::Idle);
                        return;
                    }
                }

                LiveState::SearchAddressMarkData => {
                    if self.read_one_bit(medium.as_ref(), limit) {
                        return;
                    }
                    let counter = self.live.bit_counter;
                    let shift = self.live.shift_reg;
                    if self.mfm {
                        if counter > 62 * 16 {
                            self.live_delay(LiveState::SearchAddressMarkDataFailed);
                            return;
                        }
                        if counter >= 28 * 16 && shift == MFM_SYNC {
                            self.live.crc = CRC_AFTER_A1;
                            self.live.data_separator_phase = false;
                            self.live.bit_counter = 0;
                            self.live.state = LiveState::ReadDataBlockHeader;
                        }
                    } else {
                        if counter > 23 * 16 {
                            self.live_delay(LiveState::SearchAddressMarkDataFailed);
                            return;
                        }
                        if counter >= 11 * 16 && (shift == FM_DELETED_MARK || shift == FM_DATA_MARK) {
                            let deleted = shift == FM_DELETED_MARK;
                            self.live.crc = if deleted { CRC_FM_DELETED } else { CRC_FM_DATA };
                            self.live.data_separator_phase = false;
                            self.live.bit_counter = 0;
                            self.begin_data_field(deleted);
                        }
                    }
                }

                LiveState::ReadDataBlockHeader => {
                    if self.read_one_bit(medium.as_ref(), limit) {
                        return;
                    }
                    if self.live.bit_counter & 15 != 0 {
                        continue;
                    }
                    let slot = self.live.bit_counter >> 4;
                    if slot < 3 {
                        if self.live.shift_reg != MFM_SYNC {
                            self.live_delay(LiveState::SearchAddressMarkDataFailed);
                            return;
                        }
                        continue;
                    }
                    let mark = self.live.data_reg;
                    if mark != 0xFB && mark != 0xF8 {
                        self.live_delay(LiveState::SearchAddressMarkDataFailed);
                        return;
                    }
                    self.live.bit_counter = 0;
                    self.begin_data_field(mark == 0xF8);
                }

                LiveState::SearchAddressMarkDataFailed => {
                    self.st1 |= ST1_MA;
                    self.st2 |= ST2_MD;
                    self.live_release();
                    return;
                }

                LiveState::ReadSectorData => {
                    if self.read_one_bit(medium.as_ref(), limit) {
                        return;
                    }
                    if self.live.bit_counter & 15 != 0 {
                        continue;
                    }
                    let slot = (self.live.bit_counter >> 4) as usize - 1;
                    if slot < self.sector_size {
                        let byte_state = if self.drives[drive].main_state == MainState::ScanData {
                            LiveState::ScanSectorDataByte
                        } else {
                            LiveState::ReadSectorDataByte
                        };
                        self.live_delay(byte_state);
                        return;
                    }
                    if slot == self.sector_size + 1 {
                        self.live_delay(LiveState::Idle);
                        return;
                    }
                }

                LiveState::ReadSectorDataByte => {
                    if !self.tc_done && !self.live.skip {
                        self.fifo_push(self.live.data_reg, true);
                    }
                    self.live.state = LiveState::ReadSectorData;
                    self.checkpoint();
                }

                LiveState::ScanSectorDataByte => {
                    if !self.tc_done && !self.live.skip {
                        let host = self.fifo_pop(true);
                        self.scan_compare(host, self.live.data_reg);
                    }
                    self.live.state = LiveState::ReadSectorData;
                    self.checkpoint();
                }

                LiveState::WriteSectorSkipGap2 => {
                    self.live.bit_counter = 0;
                    self.live.byte_counter = 0;
                    self.live.state = LiveState::WriteSectorSkipGap2Byte;
                    self.checkpoint();
                }

                LiveState::WriteSectorSkipGap2Byte => {
                    if self.read_one_bit(medium.as_ref(), limit) {
                        return;
                    }
                    let gap2 = if self.mfm { 22 * 16 } else { 11 * 16 };
                    if self.live.bit_counter != gap2 {
                        continue;
                    }
                    self.live.bit_counter = 0;
                    self.live.byte_counter = 0;
                    self.live_delay(LiveState::WriteSectorData);
                    return;
                }

                LiveState::WriteSectorData => {
                    if !self.write_sector_byte() {
                        self.live_stop_writing();
                        self.live_release();
                        return;
                    }
                    self.live.state = LiveState::WriteSectorDataByte;
                    self.live.bit_counter = 16;
                    self.checkpoint();
                }

                LiveState::WriteTrackPreSectors => {
                    if self.live.byte_counter == 0 && self.command[3] != 0 {
                        self.fifo_expect(4, true);
                    }
                    if !self.write_track_preamble_byte() {
                        self.live.byte_counter = 0;
                        self.live.state = if self.command[3] == 0 {
                            LiveState::WriteTrackPostSectors
                        } else {
                            LiveState::WriteTrackSector
                        };
                        continue;
                    }
                    self.live.state = LiveState::WriteTrackPreSectorsByte;
                    self.live.bit_counter = 16;
                    self.checkpoint();
                }

                LiveState::WriteTrackSector => {
                    if self.live.byte_counter == 0 {
                        self.command[3] = self.command[3].saturating_sub(1);
                        if self.command[3] != 0 {
                            self.fifo_expect(4, true);
                        }
                    }
                    if !self.write_track_sector_byte() {
                        self.live.byte_counter = 0;
                        self.live.state = if self.command[3] == 0 {
                            LiveState::WriteTrackPostSectors
                        } else {
                            LiveState::WriteTrackSector
                        };
                        continue;
                    }
                    self.live.state = LiveState::WriteTrackSectorByte;
                    self.live.bit_counter = 16;
                    self.checkpoint();
                }

                LiveState::WriteTrackPostSectors => {
                    self.live_write_gap();
                    self.live.state = LiveState::WriteTrackPostSectorsByte;
                    self.live.bit_counter = 16;
                    self.checkpoint();
                }

                LiveState::WriteSectorDataByte
                | LiveState::WriteTrackPreSectorsByte
                | LiveState::WriteTrackSectorByte
                | LiveState::WriteTrackPostSectorsByte => {
                    if self.write_one_bit(limit) {
                        return;
                    }
                    if self.live.bit_counter == 0 {
                        self.live.byte_counter += 1;
                        if let Some(parent) = self.live.state.byte_parent() {
                            self.live_delay(parent);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Data mark found: decide whether this field is transferred.
    fn begin_data_field(&mut self, deleted: bool) {
        let wants_deleted = self.command[0] & 0x1F == 0x0C;
        let sk = self.command[0] & 0x20 != 0;
        let filtered = matches!(
            self.live.drive.map(|d| self.drives[d].main_state),
            Some(MainState::ReadData | MainState::ScanData)
        );
        self.live.deleted = deleted;
        self.live.skip = filtered && sk && deleted != wants_deleted;
        self.live.state = LiveState::ReadSectorData;
    }

    /// Next byte of a WRITE DATA field. False once the field and its gap
    /// are out.
    fn write_sector_byte(&mut self) -> bool {
        let n = self.live.byte_counter as usize;
        let size = self.sector_size;
        let gpl = usize::from(self.command[7]);
        let deleted = self.command[0] & 0x08 != 0;
        if self.mfm {
            match n {
                0..12 => self.live_write_mfm(0x00),
                12..15 => self.live_write_raw(MFM_SYNC),
                15 => {
                    self.live.crc = CRC_AFTER_SYNC;
                    self.live_write_mfm(if deleted { 0xF8 } else { 0xFB });
                }
                _ if n < 16 + size => {
                    let byte = self.next_write_byte();
                    self.live_write_mfm(byte);
                }
                _ if n < 18 + size => self.live_write_mfm((self.live.crc >> 8) as u8),
                _ if n < 18 + size + gpl => self.live_write_mfm(0x4E),
                _ => return false,
            }
        } else {
            match n {
                0..6 => self.live_write_fm(0x00),
                6 => {
                    self.live.crc = 0xFFFF;
                    self.live_write_raw(if deleted { FM_DELETED_MARK } else { FM_DATA_MARK });
                }
                _ if n < 7 + size => {
                    let byte = self.next_write_byte();
                    self.live_write_fm(byte);
                }
                _ if n < 9 + size => self.live_write_fm((self.live.crc >> 8) as u8),
                _ if n < 9 + size + gpl => self.live_write_fm(0xFF),
                _ => return false,
            }
        }
        true
    }

    /// Host data, or zeros once TC has ended the transfer.
    fn next_write_byte(&mut self) -> u8 {
        if self.tc_done && self.fifo.is_empty() {
            0x00
        } else {
            self.fifo_pop(true)
        }
    }

    /// Index address mark and gap 1. False once done.
    fn write_track_preamble_byte(&mut self) -> bool {
        let n = self.live.byte_counter;
        if self.mfm {
            match n {
                0..80 => self.live_write_mfm(0x4E),
                80..92 => self.live_write_mfm(0x00),
                92..95 => self.live_write_raw(MFM_INDEX_SYNC),
                95 => self.live_write_mfm(0xFC),
                96..146 => self.live_write_mfm(0x4E),
                _ => return false,
            }
        } else {
            match n {
                0..40 => self.live_write_fm(0xFF),
                40..46 => self.live_write_fm(0x00),
                46 => self.live_write_raw(FM_INDEX_MARK),
                47..73 => self.live_write_fm(0xFF),
                _ => return false,
            }
        }
        true
    }

    /// One formatted sector: ID field from the FIFO, gap 2, data field of
    /// filler bytes, gap 3. False once done.
    fn write_track_sector_byte(&mut self) -> bool {
        let n = self.live.byte_counter as usize;
        let size = self.sector_size;
        let gpl = usize::from(self.command[4]);
        let filler = self.command[5];
        if self.mfm {
            match n {
                0..12 | 44..56 => self.live_write_mfm(0x00),
                12..15 | 56..59 => self.live_write_raw(MFM_SYNC),
                15 => {
                    self.live.crc = CRC_AFTER_SYNC;
                    self.live_write_mfm(0xFE);
                }
                16..20 => {
                    let byte = self.format_id_byte(n - 16);
                    self.live_write_mfm(byte);
                }
                20..22 => self.live_write_mfm((self.live.crc >> 8) as u8),
                22..44 => self.live_write_mfm(0x4E),
                59 => {
                    self.live.crc = CRC_AFTER_SYNC;
                    self.live_write_mfm(0xFB);
                }
                _ if n < 60 + size => self.live_write_mfm(filler),
                _ if n < 62 + size => self.live_write_mfm((self.live.crc >> 8) as u8),
                _ if n < 62 + size + gpl => self.live_write_mfm(0x4E),
                _ => return false,
            }
        } else {
            match n {
                0..6 | 24..30 => self.live_write_fm(0x00),
                6 => {
                    self.live.crc = 0xFFFF;
                    self.live_write_raw(FM_ID_MARK);
                }
                7..11 => {
                    let byte = self.format_id_byte(n - 7);
                    self.live_write_fm(byte);
                }
                11..13 => self.live_write_fm((self.live.crc >> 8) as u8),
                13..24 => self.live_write_fm(0xFF),
                30 => {
                    self.live.crc = 0xFFFF;
                    self.live_write_raw(FM_DATA_MARK);
                }
                _ if n < 31 + size => self.live_write_fm(filler),
                _ if n < 33 + size => self.live_write_fm((self.live.crc >> 8) as u8),
                _ if n < 33 + size + gpl => self.live_write_fm(0xFF),
                _ => return false,
            }
        }
        true
    }

    /// ID byte `i` (C, H, R, N) of the sector being formatted.
    fn format_id_byte(&mut self, i: usize) -> u8 {
        let byte = self.fifo_pop(true);
        self.command[12 + i] = byte;
        if i == 3 {
            debug!(
                c = self.command[12],
                h = self.command[13],
                r = self.command[14],
                n = self.command[15],
                "formatting sector"
            );
        }
        byte
    }

    fn live_write_gap(&mut self) {
        if self.mfm {
            self.live_write_mfm(0x4E);
        } else {
            self.live_write_fm(0xFF);
        }
    }

    /// Recover one cell. True when suspended at `limit`.
    fn read_one_bit(&mut self, medium: Option<&Rc<RefCell<dyn Medium>>>, limit: Time) -> bool {
        let guard = medium.map(|m| m.borrow());
        let live = &mut self.live;
        let Some(bit) = live.pll.get_next_bit(&mut live.tm, guard.as_deref(), limit) else {
            return true;
        };
        live.shift_reg = (live.shift_reg << 1) | u16::from(bit);
        live.bit_counter += 1;
        if live.data_separator_phase {
            live.data_reg = (live.data_reg << 1) | u8::from(bit);
            live.crc = crc_step(live.crc, bit);
        }
        live.data_separator_phase = !live.data_separator_phase;
        false
    }

    /// Emit the top cell of the shift register. True when suspended.
    fn write_one_bit(&mut self, limit: Time) -> bool {
        let live = &mut self.live;
        let bit = live.shift_reg & 0x8000 != 0;
        if live.pll.write_next_bit(bit, &mut live.tm, limit) {
            return true;
        }
        if live.bit_counter & 1 != 0 {
            live.crc = crc_step(live.crc, bit);
        }
        live.shift_reg <<= 1;
        live.bit_counter -= 1;
        false
    }

    fn live_write_raw(&mut self, raw: u16) {
        self.live.shift_reg = raw;
        self.live.data_bit_context = raw & 1 != 0;
    }

    fn live_write_mfm(&mut self, byte: u8) {
        let mut context = self.live.data_bit_context;
        let mut raw = 0u16;
        for i in 0..8 {
            let bit = byte & (0x80 >> i) != 0;
            if !(bit || context) {
                raw |= 0x8000 >> (2 * i);
            }
            if bit {
                raw |= 0x4000 >> (2 * i);
            }
            context = bit;
        }
        self.live.data_reg = byte;
        self.live.shift_reg = raw;
        self.live.data_bit_context = context;
    }

    fn live_write_fm(&mut self, byte: u8) {
        let mut raw = 0xAAAAu16;
        for i in 0..8 {
            if byte & (0x80 >> i) != 0 {
                raw |= 0x4000 >> (2 * i);
            }
        }
        self.live.data_reg = byte;
        self.live.shift_reg = raw;
        self.live.data_bit_context = byte & 1 != 0;
    }
}
