//! PC/CPC-style floppy drive mechanism at flux level.
//!
//! The drive turns a disk whose tracks are lists of flux transition
//! offsets from the index hole. A controller sees it through
//! [`emu_core::Medium`]: it asks for the next transition after a time,
//! writes transitions back over a window, and drives motor, step,
//! direction and side. Rotation starts when the motor is switched on and
//! stops when it is switched off.

pub mod crc;
mod image;
pub mod track;

use emu_core::{Medium, Time};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use image::{DiskFormat, ImageError};
use track::{Encoding, TrackBuilder};

/// Mechanical parameters of a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub cylinders: u8,
    pub heads: u8,
    pub rpm: u32,
    /// Index pulse width in microseconds.
    pub index_pulse_us: u64,
}

impl DriveConfig {
    /// 3.5" double-sided, 80 cylinders, 300 rpm.
    #[must_use]
    pub fn pc_35() -> Self {
        Self {
            cylinders: 84,
            heads: 2,
            rpm: 300,
            index_pulse_us: 2000,
        }
    }

    /// 5.25" 40-track, 300 rpm.
    #[must_use]
    pub fn pc_525_dd() -> Self {
        Self {
            cylinders: 42,
            ..Self::pc_35()
        }
    }

    /// 3" single-sided CPC/+3 drive.
    #[must_use]
    pub fn cpc_3() -> Self {
        Self {
            cylinders: 42,
            heads: 1,
            ..Self::pc_35()
        }
    }

    /// Duration of one revolution.
    #[must_use]
    pub fn revolution(&self) -> Time {
        Time::from_ps(60_000_000_000_000 / u64::from(self.rpm.max(1)))
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self::pc_35()
    }
}

/// Disk surface: one transition list per (cylinder, head).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxDisk {
    heads: u8,
    /// Offsets in picoseconds from the index, sorted, all below one revolution.
    tracks: Vec<Vec<u64>>,
    pub write_protected: bool,
}

impl FluxDisk {
    /// Blank, unformatted disk.
    #[must_use]
    pub fn unformatted(cylinders: u8, heads: u8) -> Self {
        Self {
            heads: heads.max(1),
            tracks: vec![Vec::new(); usize::from(cylinders) * usize::from(heads.max(1))],
            write_protected: false,
        }
    }

    #[must_use]
    pub fn heads(&self) -> u8 {
        self.heads
    }

    fn slot(&self, cylinder: u8, head: u8) -> Option<usize> {
        if head >= self.heads {
            return None;
        }
        let slot = usize::from(cylinder) * usize::from(self.heads) + usize::from(head);
        (slot < self.tracks.len()).then_some(slot)
    }

    #[must_use]
    pub fn track(&self, cylinder: u8, head: u8) -> &[u64] {
        self.slot(cylinder, head).map_or(&[], |s| &self.tracks[s])
    }

    /// Replace a track with the cells of `builder` at `cell_ps` per cell.
    pub fn set_track(&mut self, cylinder: u8, head: u8, builder: &TrackBuilder, cell_ps: u64) {
        if let Some(slot) = self.slot(cylinder, head) {
            self.tracks[slot] = builder.to_flux(cell_ps);
        }
    }

    fn track_mut(&mut self, cylinder: u8, head: u8) -> Option<&mut Vec<u64>> {
        let slot = self.slot(cylinder, head)?;
        self.tracks.get_mut(slot)
    }
}

/// A drive with an optional disk.
#[derive(Debug, Clone)]
pub struct FluxDrive {
    config: DriveConfig,
    disk: Option<FluxDisk>,
    cylinder: u8,
    head: u8,
    outward: bool,
    step_level: bool,
    motor_on: bool,
    /// Time the disk passed the index hole with the motor on.
    origin: Time,
    disk_changed: bool,
}

impl FluxDrive {
    #[must_use]
    pub fn new(config: DriveConfig) -> Self {
        Self {
            config,
            disk: None,
            cylinder: 0,
            head: 0,
            outward: false,
            step_level: false,
            motor_on: false,
            origin: Time::ZERO,
            disk_changed: true,
        }
    }

    pub fn insert(&mut self, disk: FluxDisk) {
        debug!(heads = disk.heads(), "disk inserted");
        self.disk = Some(disk);
    }

    pub fn eject(&mut self) -> Option<FluxDisk> {
        debug!("disk ejected");
        self.disk_changed = true;
        self.disk.take()
    }

    #[must_use]
    pub fn disk(&self) -> Option<&FluxDisk> {
        self.disk.as_ref()
    }

    pub fn disk_mut(&mut self) -> Option<&mut FluxDisk> {
        self.disk.as_mut()
    }

    #[must_use]
    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    #[must_use]
    pub fn cylinder(&self) -> u8 {
        self.cylinder
    }

    #[must_use]
    pub fn head(&self) -> u8 {
        self.head
    }

    #[must_use]
    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    /// Place the head without step pulses (machine setup, tests).
    pub fn set_cylinder(&mut self, cylinder: u8) {
        self.cylinder = cylinder.min(self.config.cylinders.saturating_sub(1));
    }

    /// Cell stream of a track, recovered from flux spacing.
    #[must_use]
    pub fn track_cells(&self, cylinder: u8, head: u8, encoding: Encoding, data_rate: u32) -> Vec<bool> {
        let Some(disk) = &self.disk else {
            return Vec::new();
        };
        let cell_ps = Time::from_hz(encoding.cell_rate(data_rate)).as_ps();
        track::cells_from_flux(disk.track(cylinder, head), cell_ps)
    }

    fn spinning(&self) -> bool {
        self.motor_on && self.disk.is_some()
    }

    fn revolution_ps(&self) -> u64 {
        self.config.revolution().as_ps()
    }

    /// Revolution number and offset within it.
    fn position(&self, at: Time) -> (u64, u64) {
        let rel = at.as_ps().saturating_sub(self.origin.as_ps());
        let rev = self.revolution_ps();
        (rel / rev, rel % rev)
    }

    fn current_track(&self) -> &[u64] {
        self.disk
            .as_ref()
            .map_or(&[], |d| d.track(self.cylinder, self.head))
    }
}

impl Default for FluxDrive {
    fn default() -> Self {
        Self::new(DriveConfig::default())
    }
}

impl Medium for FluxDrive {
    fn next_transition(&self, from: Time) -> Option<Time> {
        if !self.spinning() || from.is_never() {
            return None;
        }
        let track = self.current_track();
        let first = *track.first()?;
        let (turn, pos) = self.position(from);
        let rev = self.revolution_ps();
        let next = track.partition_point(|&t| t <= pos);
        let (turn, offset) = match track.get(next) {
            Some(&offset) => (turn, offset),
            None => (turn + 1, first),
        };
        Some(Time::from_ps(self.origin.as_ps() + turn * rev + offset))
    }

    fn write_flux(&mut self, start: Time, end: Time, transitions: &[Time]) {
        if !self.spinning() || end <= start {
            return;
        }
        let rev = self.revolution_ps();
        let origin = self.origin.as_ps();
        let (_, from) = self.position(start);
        let span = end.diff(start).unsigned_abs();
        let (cylinder, head) = (self.cylinder, self.head);
        let Some(disk) = self.disk.as_mut() else { return };
        if disk.write_protected {
            return;
        }
        let Some(track) = disk.track_mut(cylinder, head) else {
            return;
        };

        if span >= rev {
            track.clear();
        } else {
            let to = (from + span) % rev;
            if from <= to {
                track.retain(|&t| t < from || t >= to);
            } else {
                track.retain(|&t| t >= to && t < from);
            }
        }
        track.extend(
            transitions
                .iter()
                .map(|t| t.as_ps().saturating_sub(origin) % rev),
        );
        track.sort_unstable();
        track.dedup();
        trace!(cylinder, head, count = transitions.len(), %start, %end, "flux written");
    }

    fn index(&self, at: Time) -> bool {
        self.spinning() && self.position(at).1 < self.config.index_pulse_us * 1_000_000
    }

    fn next_index_edge(&self, after: Time) -> Option<(Time, bool)> {
        if !self.spinning() || after.is_never() {
            return None;
        }
        if after < self.origin {
            return Some((self.origin, true));
        }
        let width = self.config.index_pulse_us * 1_000_000;
        let (turn, pos) = self.position(after);
        let base = self.origin.as_ps() + turn * self.revolution_ps();
        if pos < width {
            Some((Time::from_ps(base + width), false))
        } else {
            Some((Time::from_ps(base + self.revolution_ps()), true))
        }
    }

    fn track0(&self) -> bool {
        self.cylinder == 0
    }

    fn write_protected(&self) -> bool {
        self.disk.as_ref().is_some_and(|d| d.write_protected)
    }

    fn ready(&self) -> bool {
        self.spinning()
    }

    fn two_sided(&self) -> bool {
        self.config.heads > 1
    }

    fn disk_changed(&self) -> bool {
        self.disk_changed
    }

    fn set_side(&mut self, head: u8) {
        self.head = head & 1;
    }

    fn set_direction(&mut self, outward: bool) {
        self.outward = outward;
    }

    fn set_step(&mut self, level: bool) {
        let rising = level && !self.step_level;
        self.step_level = level;
        if !rising {
            return;
        }
        if self.outward {
            self.cylinder = self.cylinder.saturating_sub(1);
        } else if self.cylinder + 1 < self.config.cylinders {
            self.cylinder += 1;
        }
        if self.disk.is_some() {
            self.disk_changed = false;
        }
        trace!(cylinder = self.cylinder, "head stepped");
    }

    fn set_motor(&mut self, on: bool, at: Time) {
        if on && !self.motor_on {
            self.origin = at;
        }
        self.motor_on = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use track::{SectorSpec, build_ibm_track};

    const REV: u64 = 200_000_000_000;

    fn spinning_drive_with(offsets: Vec<u64>) -> FluxDrive {
        let mut disk = FluxDisk::unformatted(80, 2);
        disk.tracks[0] = offsets;
        let mut drive = FluxDrive::default();
        drive.insert(disk);
        drive.set_motor(true, Time::ZERO);
        drive
    }

    #[test]
    fn revolution_at_300_rpm() {
        assert_eq!(DriveConfig::pc_35().revolution(), Time::from_millis(200));
    }

    #[test]
    fn next_transition_wraps_around_index() {
        let drive = spinning_drive_with(vec![1_000, 5_000]);
        assert_eq!(drive.next_transition(Time::ZERO), Some(Time::from_ps(1_000)));
        assert_eq!(drive.next_transition(Time::from_ps(1_000)), Some(Time::from_ps(5_000)), "strictly after");
        assert_eq!(drive.next_transition(Time::from_ps(6_000)), Some(Time::from_ps(REV + 1_000)));
    }

    #[test]
    fn no_flux_without_motor_or_disk() {
        let mut drive = spinning_drive_with(vec![1_000]);
        drive.set_motor(false, Time::from_millis(1));
        assert_eq!(drive.next_transition(Time::ZERO), None);
        assert!(!drive.ready());
        assert_eq!(FluxDrive::default().next_index_edge(Time::ZERO), None);
    }

    #[test]
    fn index_pulse_edges() {
        let drive = spinning_drive_with(Vec::new());
        let width = 2_000_000_000;
        assert!(drive.index(Time::ZERO));
        assert_eq!(drive.next_index_edge(Time::ZERO), Some((Time::from_ps(width), false)));
        assert_eq!(drive.next_index_edge(Time::from_ps(width)), Some((Time::from_ps(REV), true)));
        assert_eq!(drive.next_index(Time::ZERO), Some(Time::from_ps(REV)));
        assert_eq!(drive.next_index(Time::from_ps(REV)), Some(Time::from_ps(2 * REV)));

        let mut late = spinning_drive_with(Vec::new());
        late.set_motor(false, Time::ZERO);
        late.set_motor(true, Time::from_millis(5));
        assert_eq!(
            late.next_index_edge(Time::from_millis(1)),
            Some((Time::from_millis(5), true)),
            "spin-up starts with an index pulse"
        );
    }

    #[test]
    fn write_replaces_window_only() {
        let mut drive = spinning_drive_with(vec![100, 200, 300, 400]);
        drive.write_flux(
            Time::from_ps(150),
            Time::from_ps(350),
            &[Time::from_ps(250)],
        );
        assert_eq!(drive.disk().expect("disk").track(0, 0), &[100, 250, 400]);
    }

    #[test]
    fn write_window_can_cross_the_index() {
        let mut drive = spinning_drive_with(vec![100, REV / 2, REV - 100]);
        drive.write_flux(
            Time::from_ps(REV - 200),
            Time::from_ps(REV + 200),
            &[Time::from_ps(REV + 50)],
        );
        assert_eq!(drive.disk().expect("disk").track(0, 0), &[50, REV / 2]);
    }

    #[test]
    fn write_protect_blocks_writes() {
        let mut drive = spinning_drive_with(vec![100]);
        drive.disk_mut().expect("disk").write_protected = true;
        drive.write_flux(Time::ZERO, Time::from_ps(1_000), &[]);
        assert_eq!(drive.disk().expect("disk").track(0, 0), &[100]);
        assert!(drive.write_protected());
    }

    #[test]
    fn stepping_follows_direction_and_limits() {
        let mut drive = FluxDrive::new(DriveConfig::cpc_3());
        drive.set_direction(false);
        for _ in 0..50 {
            drive.set_step(false);
            drive.set_step(true);
        }
        assert_eq!(drive.cylinder(), 41, "stops at the last cylinder");
        assert!(!drive.track0());

        drive.set_direction(true);
        drive.set_step(true);
        assert_eq!(drive.cylinder(), 41, "no edge, no step");
        drive.set_step(false);
        drive.set_step(true);
        assert_eq!(drive.cylinder(), 40);
    }

    #[test]
    fn disk_change_cleared_by_step_with_disk() {
        let mut drive = FluxDrive::default();
        assert!(drive.disk_changed());
        drive.insert(FluxDisk::unformatted(80, 2));
        assert!(drive.disk_changed(), "latched until a step");
        drive.set_step(true);
        assert!(!drive.disk_changed());
        drive.eject();
        assert!(drive.disk_changed());
    }

    #[test]
    fn built_track_reads_back_as_cells() {
        let data = [0x99u8; 512];
        let built = build_ibm_track(Encoding::Mfm, &[SectorSpec::new([0, 0, 1, 2], &data)], 84);
        let mut disk = FluxDisk::unformatted(80, 2);
        disk.set_track(0, 0, &built, 2_000_000);
        let mut drive = FluxDrive::default();
        drive.insert(disk);

        let cells = drive.track_cells(0, 0, Encoding::Mfm, 250_000);
        let fields = track::scan_fields(&cells, Encoding::Mfm);
        assert_eq!(fields.len(), 2);
    }
}
