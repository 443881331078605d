//! The floppy medium as seen from a disk controller.
//!
//! A controller never owns the drive. It reads flux transitions and
//! mechanical status through this trait and drives the control inputs
//! (motor, step, direction, side). Levels here are logical: `true` means
//! asserted, whatever the electrical polarity of the real cable.

use crate::Time;

/// A drive with (possibly) a disk in it.
pub trait Medium {
    /// First flux transition strictly after `from`, or `None` when the disk
    /// is not turning or the track is unformatted.
    fn next_transition(&self, from: Time) -> Option<Time>;

    /// Replace the flux in `[start, end)` on the current track with
    /// `transitions` (sorted, all inside the window).
    fn write_flux(&mut self, start: Time, end: Time, transitions: &[Time]);

    /// Index line level at `at`.
    fn index(&self, at: Time) -> bool;

    /// Next change of the index line strictly after `after`, with the new
    /// level.
    fn next_index_edge(&self, after: Time) -> Option<(Time, bool)>;

    /// Next rising index edge strictly after `after`.
    fn next_index(&self, after: Time) -> Option<Time> {
        let mut cursor = after;
        loop {
            let (at, level) = self.next_index_edge(cursor)?;
            if level {
                return Some(at);
            }
            cursor = at;
        }
    }

    /// Head is on cylinder 0.
    fn track0(&self) -> bool;

    fn write_protected(&self) -> bool;

    /// Drive reports ready (disk present and spinning).
    fn ready(&self) -> bool;

    fn two_sided(&self) -> bool;

    /// Disk change latch.
    fn disk_changed(&self) -> bool;

    fn set_side(&mut self, head: u8);

    /// Step direction: `true` steps outward, toward cylinder 0.
    fn set_direction(&mut self, outward: bool);

    /// Step line. The head moves on the rising edge.
    fn set_step(&mut self, level: bool);

    fn set_motor(&mut self, on: bool, at: Time);
}
