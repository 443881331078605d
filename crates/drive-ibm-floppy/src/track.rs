//! IBM System/34 (MFM) and System/3740 (FM) track encoding.
//!
//! A track is built as a stream of bit cells. In MFM every data bit is
//! preceded by a clock cell that is set only between two zero data bits;
//! in FM every clock cell is set. Address marks break those rules on
//! purpose so they can never appear inside data:
//!
//! | Mark | MFM raw | FM raw |
//! |---|---|---|
//! | sync (A1, missing clock) | `4489` | n/a |
//! | index sync (C2) | `5224` | `F77A` (FC) |
//! | ID address mark | `4489`×3 + FE | `F57E` |
//! | data address mark | `4489`×3 + FB | `F56F` |
//! | deleted data mark | `4489`×3 + F8 | `F56A` |
//!
//! Flux transitions sit at the centre of each set cell.

use serde::{Deserialize, Serialize};

use crate::crc::{CRC_AFTER_MFM_SYNC, CRC_PRESET, crc16_bit, crc16_byte};

pub const MFM_SYNC: u16 = 0x4489;
pub const MFM_INDEX_SYNC: u16 = 0x5224;
pub const FM_INDEX_MARK: u16 = 0xF77A;
pub const FM_ID_MARK: u16 = 0xF57E;
pub const FM_DATA_MARK: u16 = 0xF56F;
pub const FM_DELETED_MARK: u16 = 0xF56A;

pub const ID_MARK: u8 = 0xFE;
pub const DATA_MARK: u8 = 0xFB;
pub const DELETED_MARK: u8 = 0xF8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Fm,
    Mfm,
}

impl Encoding {
    /// Gap filler byte.
    #[must_use]
    pub fn gap_byte(self) -> u8 {
        match self {
            Encoding::Fm => 0xFF,
            Encoding::Mfm => 0x4E,
        }
    }

    /// Bit cells per second at a given data rate.
    #[must_use]
    pub fn cell_rate(self, data_rate: u32) -> u64 {
        match self {
            Encoding::Fm => u64::from(data_rate),
            Encoding::Mfm => 2 * u64::from(data_rate),
        }
    }
}

/// Encode one byte as 16 raw cells.
#[must_use]
pub fn mfm_encode(byte: u8, previous_bit: bool) -> u16 {
    let mut context = previous_bit;
    let mut raw = 0u16;
    for i in 0..8 {
        let bit = byte & (0x80 >> i) != 0;
        if !bit && !context {
            raw |= 0x8000 >> (2 * i);
        }
        if bit {
            raw |= 0x4000 >> (2 * i);
        }
        context = bit;
    }
    raw
}

#[must_use]
pub fn fm_encode(byte: u8) -> u16 {
    let mut raw = 0xAAAA;
    for i in 0..8 {
        if byte & (0x80 >> i) != 0 {
            raw |= 0x4000 >> (2 * i);
        }
    }
    raw
}

/// Data bits of a raw 16-cell word.
#[must_use]
pub fn decode_raw(raw: u16) -> u8 {
    (0..8).fold(0u8, |acc, i| (acc << 1) | u8::from(raw & (0x4000 >> (2 * i)) != 0))
}

/// One sector to lay down on a track.
#[derive(Debug, Clone, Copy)]
pub struct SectorSpec<'a> {
    /// C, H, R, N.
    pub id: [u8; 4],
    pub data: &'a [u8],
    pub deleted: bool,
    pub id_crc_error: bool,
    pub data_crc_error: bool,
    /// Leave out the data field entirely.
    pub no_data_field: bool,
}

impl<'a> SectorSpec<'a> {
    #[must_use]
    pub fn new(id: [u8; 4], data: &'a [u8]) -> Self {
        Self {
            id,
            data,
            deleted: false,
            id_crc_error: false,
            data_crc_error: false,
            no_data_field: false,
        }
    }
}

/// Cell-level track writer with a running CRC.
#[derive(Debug, Clone)]
pub struct TrackBuilder {
    encoding: Encoding,
    cells: Vec<bool>,
    last_data: bool,
    crc: u16,
}

impl TrackBuilder {
    #[must_use]
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            cells: Vec::new(),
            last_data: false,
            crc: CRC_PRESET,
        }
    }

    /// Append raw cells, MSB first. Data cells still feed the CRC.
    pub fn raw(&mut self, raw: u16) {
        for i in (0..16).rev() {
            let cell = raw & (1 << i) != 0;
            if i & 1 == 0 {
                self.crc = crc16_bit(self.crc, cell);
            }
            self.cells.push(cell);
        }
        self.last_data = raw & 1 != 0;
    }

    pub fn byte(&mut self, byte: u8) {
        let raw = match self.encoding {
            Encoding::Mfm => mfm_encode(byte, self.last_data),
            Encoding::Fm => fm_encode(byte),
        };
        self.raw(raw);
    }

    pub fn repeat(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.byte(byte);
        }
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.byte(b);
        }
    }

    /// Write the current CRC, optionally corrupted.
    pub fn crc(&mut self, corrupt: bool) {
        let [hi, lo] = self.crc.to_be_bytes();
        self.byte(hi);
        self.byte(lo ^ u8::from(corrupt));
    }

    /// Sync run and address mark. Resets the CRC the way the controller does.
    pub fn address_mark(&mut self, mark: u8) {
        match self.encoding {
            Encoding::Mfm => {
                self.repeat(0x00, 12);
                for _ in 0..3 {
                    self.raw(MFM_SYNC);
                }
                self.crc = CRC_AFTER_MFM_SYNC;
                self.byte(mark);
            }
            Encoding::Fm => {
                self.repeat(0x00, 6);
                self.crc = CRC_PRESET;
                self.raw(match mark {
                    ID_MARK => FM_ID_MARK,
                    DELETED_MARK => FM_DELETED_MARK,
                    _ => FM_DATA_MARK,
                });
            }
        }
    }

    /// Index address mark with its leading gap and sync.
    pub fn index_mark(&mut self) {
        match self.encoding {
            Encoding::Mfm => {
                self.repeat(0x4E, 80);
                self.repeat(0x00, 12);
                for _ in 0..3 {
                    self.raw(MFM_INDEX_SYNC);
                }
                self.byte(0xFC);
                self.repeat(0x4E, 50);
            }
            Encoding::Fm => {
                self.repeat(0xFF, 40);
                self.repeat(0x00, 6);
                self.raw(FM_INDEX_MARK);
                self.repeat(0xFF, 26);
            }
        }
    }

    /// One complete sector: ID field, gap 2, data field, gap 3.
    pub fn sector(&mut self, sector: &SectorSpec<'_>, gap3: u8) {
        let gap = self.encoding.gap_byte();
        self.address_mark(ID_MARK);
        self.bytes(&sector.id);
        self.crc(sector.id_crc_error);
        self.repeat(gap, if self.encoding == Encoding::Mfm { 22 } else { 11 });
        if !sector.no_data_field {
            self.address_mark(if sector.deleted { DELETED_MARK } else { DATA_MARK });
            self.bytes(sector.data);
            self.crc(sector.data_crc_error);
        }
        self.repeat(gap, usize::from(gap3));
    }

    /// Pad with gap bytes up to `cells` (rounded down to whole bytes).
    pub fn fill_to(&mut self, cells: usize) {
        let gap = self.encoding.gap_byte();
        while self.cells.len() + 16 <= cells {
            self.byte(gap);
        }
    }

    #[must_use]
    pub fn cells(&self) -> &[bool] {
        &self.cells
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Flux transition offsets (picoseconds from index) for a cell length.
    #[must_use]
    pub fn to_flux(&self, cell_ps: u64) -> Vec<u64> {
        self.cells
            .iter()
            .enumerate()
            .filter(|&(_, &set)| set)
            .map(|(i, _)| i as u64 * cell_ps + cell_ps / 2)
            .collect()
    }
}

/// Standard track layout: index mark, then every sector.
#[must_use]
pub fn build_ibm_track(encoding: Encoding, sectors: &[SectorSpec<'_>], gap3: u8) -> TrackBuilder {
    let mut track = TrackBuilder::new(encoding);
    track.index_mark();
    for sector in sectors {
        track.sector(sector, gap3);
    }
    track
}

/// Recover a cell stream from flux by measuring transition spacing.
///
/// Independent of where the writer's cell grid started, which makes it
/// suitable for inspecting tracks the controller wrote itself.
#[must_use]
pub fn cells_from_flux(transitions: &[u64], cell_ps: u64) -> Vec<bool> {
    let mut cells = Vec::new();
    let Some(&first) = transitions.first() else {
        return cells;
    };
    cells.push(true);
    let mut previous = first;
    for &t in &transitions[1..] {
        let gap = ((t - previous) + cell_ps / 2) / cell_ps;
        for _ in 1..gap {
            cells.push(false);
        }
        cells.push(true);
        previous = t;
    }
    cells
}

/// An address-marked field found on a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Id { cell: usize, chrn: [u8; 4], crc_ok: bool },
    Data { cell: usize, deleted: bool, data: Vec<u8>, crc_ok: bool },
}

/// Walk a cell stream and decode every ID and data field.
///
/// Data field length comes from the N of the preceding ID field. `cell` is
/// the index of the first cell after the address mark.
#[must_use]
pub fn scan_fields(cells: &[bool], encoding: Encoding) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut shift = 0u16;
    let mut size = 0usize;
    let mut pos = 0;

    while pos < cells.len() {
        shift = (shift << 1) | u16::from(cells[pos]);
        pos += 1;

        let mark = match encoding {
            Encoding::Mfm if shift == MFM_SYNC => {
                let syncs = read_raw(cells, pos, 2);
                if syncs != Some(vec![MFM_SYNC, MFM_SYNC]) {
                    continue;
                }
                let Some(mark) = read_bytes(cells, pos + 32, 1) else { break };
                pos += 48;
                mark[0]
            }
            Encoding::Fm if shift == FM_ID_MARK => ID_MARK,
            Encoding::Fm if shift == FM_DATA_MARK => DATA_MARK,
            Encoding::Fm if shift == FM_DELETED_MARK => DELETED_MARK,
            _ => continue,
        };

        let mut crc = match encoding {
            Encoding::Mfm => CRC_AFTER_MFM_SYNC,
            Encoding::Fm => CRC_PRESET,
        };
        crc = crc16_byte(crc, mark);

        let len = match mark {
            ID_MARK => 4,
            DATA_MARK | DELETED_MARK if size > 0 => size,
            _ => continue,
        };
        let Some(payload) = read_bytes(cells, pos, len + 2) else { break };
        let crc_ok = payload.iter().fold(crc, |c, &b| crc16_byte(c, b)) == 0;
        let cell = pos;
        pos += (len + 2) * 16;
        shift = 0;

        if mark == ID_MARK {
            let chrn = [payload[0], payload[1], payload[2], payload[3]];
            size = if chrn[3] > 7 { 16384 } else { 128 << chrn[3] };
            fields.push(Field::Id { cell, chrn, crc_ok });
        } else {
            fields.push(Field::Data {
                cell,
                deleted: mark == DELETED_MARK,
                data: payload[..len].to_vec(),
                crc_ok,
            });
            size = 0;
        }
    }
    fields
}

fn read_raw(cells: &[bool], at: usize, words: usize) -> Option<Vec<u16>> {
    let span = cells.get(at..at + words * 16)?;
    Some(
        span.chunks_exact(16)
            .map(|w| w.iter().fold(0u16, |acc, &c| (acc << 1) | u16::from(c)))
            .collect(),
    )
}

fn read_bytes(cells: &[bool], at: usize, count: usize) -> Option<Vec<u8>> {
    Some(read_raw(cells, at, count)?.into_iter().map(decode_raw).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mfm_clock_rule() {
        // 0x00 after a 0 bit: every clock cell set.
        assert_eq!(mfm_encode(0x00, false), 0xAAAA);
        // 0x00 after a 1 bit: first clock suppressed.
        assert_eq!(mfm_encode(0x00, true), 0x2AAA);
        assert_eq!(mfm_encode(0x4E, false), 0x9254);
        assert_eq!(mfm_encode(0xFF, false), 0x5555);
    }

    #[test]
    fn a1_sync_is_a1_with_a_missing_clock() {
        let normal = mfm_encode(0xA1, false);
        assert_eq!(decode_raw(MFM_SYNC), 0xA1);
        assert_ne!(normal, MFM_SYNC);
        assert_eq!(normal & !MFM_SYNC, 0x0020, "only the dropped clock differs");
    }

    #[test]
    fn fm_marks_carry_their_data_byte() {
        assert_eq!(decode_raw(FM_ID_MARK), 0xFE);
        assert_eq!(decode_raw(FM_DATA_MARK), 0xFB);
        assert_eq!(decode_raw(FM_DELETED_MARK), 0xF8);
        assert_eq!(decode_raw(FM_INDEX_MARK), 0xFC);
        assert_eq!(fm_encode(0xFE) & 0x5555, FM_ID_MARK & 0x5555);
    }

    #[test]
    fn mfm_sector_layout_sizes() {
        let data = [0xE5u8; 512];
        let track = build_ibm_track(Encoding::Mfm, &[SectorSpec::new([0, 0, 1, 2], &data)], 0x54);
        let bytes = 146 + 62 + 512 + 0x54;
        assert_eq!(track.len(), bytes * 16);
    }

    #[test]
    fn scan_finds_what_was_built() {
        for encoding in [Encoding::Mfm, Encoding::Fm] {
            let a = [0x11u8; 256];
            let b = [0x22u8; 256];
            let mut deleted = SectorSpec::new([7, 1, 2, 1], &b);
            deleted.deleted = true;
            deleted.data_crc_error = true;
            let track = build_ibm_track(encoding, &[SectorSpec::new([7, 1, 1, 1], &a), deleted], 27);

            let fields = scan_fields(track.cells(), encoding);
            assert_eq!(fields.len(), 4, "{encoding:?}: two ID and two data fields");
            assert!(matches!(fields[0], Field::Id { chrn: [7, 1, 1, 1], crc_ok: true, .. }));
            assert!(
                matches!(&fields[1], Field::Data { deleted: false, data, crc_ok: true, .. } if data[..] == a[..])
            );
            assert!(matches!(fields[2], Field::Id { chrn: [7, 1, 2, 1], crc_ok: true, .. }));
            assert!(matches!(fields[3], Field::Data { deleted: true, crc_ok: false, .. }));
        }
    }

    #[test]
    fn flux_round_trip_through_spacing() {
        let payload = [0x5Au8; 128];
        let track = build_ibm_track(Encoding::Mfm, &[SectorSpec::new([1, 0, 1, 0], &payload)], 20);
        let flux = track.to_flux(2_000_000);
        // Shift everything by an arbitrary phase; spacing is unchanged.
        let shifted: Vec<u64> = flux.iter().map(|t| t + 777_777).collect();
        let cells = cells_from_flux(&shifted, 2_000_000);
        let fields = scan_fields(&cells, Encoding::Mfm);
        assert!(matches!(fields[0], Field::Id { chrn: [1, 0, 1, 0], crc_ok: true, .. }));
        assert!(matches!(&fields[1], Field::Data { data, crc_ok: true, .. } if data[..] == payload[..]));
    }
}
