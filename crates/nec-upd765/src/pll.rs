//! Digital PLL for bit-cell recovery and write timing.
//!
//! Reading: each call to [`Pll::get_next_bit`] advances one cell window.
//! A flux transition inside the window is a 1 and pulls the window phase
//! toward it (65% of the error). Two or more consecutive errors of the same
//! sign also nudge the cell period, within 75%-125% of nominal.
//!
//! Writing: cells are emitted on the same time grid. Transitions for 1
//! cells are buffered and only reach the medium through [`Pll::commit`],
//! which the live engine calls at checkpoints, i.e. at real time.

use emu_core::{Medium, Time};

/// Phase correction per detected edge, in percent of the error.
const PHASE_GAIN: i64 = 65;
/// Frequency correction base, in percent of the nominal period.
const PERIOD_ADJUST_PERCENT: i64 = 5;
const MIN_PERIOD_PERCENT: i64 = 75;
const MAX_PERIOD_PERCENT: i64 = 125;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pll {
    /// Start of the current cell window.
    ctime: Time,
    /// Current cell period in picoseconds.
    period: i64,
    period_adjust_base: i64,
    min_period: i64,
    max_period: i64,
    phase_adjust: i64,
    /// Run of same-sign phase errors; sign gives the direction.
    freq_hist: i32,
    write_start: Time,
    write_buffer: Vec<Time>,
}

impl Pll {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctime: Time::NEVER,
            period: 0,
            period_adjust_base: 0,
            min_period: 0,
            max_period: 0,
            phase_adjust: 0,
            freq_hist: 0,
            write_start: Time::NEVER,
            write_buffer: Vec::new(),
        }
    }

    /// Set the nominal cell period.
    pub fn set_clock(&mut self, period: Time) {
        let period = period.as_ps() as i64;
        self.period = period;
        self.period_adjust_base = period * PERIOD_ADJUST_PERCENT / 100;
        self.min_period = period * MIN_PERIOD_PERCENT / 100;
        self.max_period = period * MAX_PERIOD_PERCENT / 100;
    }

    /// Restart the cell grid at `when` with no correction state.
    pub fn reset(&mut self, when: Time) {
        self.ctime = when;
        self.phase_adjust = 0;
        self.freq_hist = 0;
        self.write_start = Time::NEVER;
        self.write_buffer.clear();
    }

    #[must_use]
    pub fn period(&self) -> Time {
        Time::from_ps(self.period as u64)
    }

    #[must_use]
    pub fn is_writing(&self) -> bool {
        !self.write_start.is_never()
    }

    /// Recover the next cell. Returns `None` without consuming anything when
    /// the cell would end after `limit`.
    pub fn get_next_bit(&mut self, tm: &mut Time, medium: Option<&dyn Medium>, limit: Time) -> Option<bool> {
        // Windows are half-open: an edge on the boundary belongs to the
        // window it opens.
        let edge = medium.and_then(|m| m.next_transition(self.ctime.offset(-1)));
        let next = self.ctime.offset(self.period + self.phase_adjust);
        if next > limit {
            return None;
        }
        self.ctime = next;
        *tm = next;

        let Some(edge) = edge.filter(|&e| e < next) else {
            self.phase_adjust = 0;
            return Some(false);
        };

        let delta = edge.diff(next.offset(-(self.period / 2)));
        self.phase_adjust = delta * PHASE_GAIN / 100;

        self.freq_hist = match delta.signum() {
            -1 if self.freq_hist < 0 => self.freq_hist - 1,
            -1 => -1,
            1 if self.freq_hist > 0 => self.freq_hist + 1,
            1 => 1,
            _ => 0,
        };
        if self.freq_hist.abs() > 1 {
            let adjust = i128::from(self.period_adjust_base) * i128::from(delta) / i128::from(self.period.max(1));
            self.period = (self.period + adjust as i64).clamp(self.min_period, self.max_period);
        }
        Some(true)
    }

    /// Emit one cell. Returns true (suspended) when the cell would end after
    /// `limit`.
    pub fn write_next_bit(&mut self, bit: bool, tm: &mut Time, limit: Time) -> bool {
        if self.write_start.is_never() {
            self.write_start = self.ctime;
            self.write_buffer.clear();
        }
        let etime = self.ctime.offset(self.period);
        if etime > limit {
            return true;
        }
        if bit {
            self.write_buffer.push(self.ctime.offset(self.period / 2));
        }
        self.ctime = etime;
        *tm = etime;
        false
    }

    pub fn start_writing(&mut self, tm: Time) {
        self.write_start = tm;
        self.write_buffer.clear();
    }

    /// Flush buffered transitions over `[write_start, tm)` and reopen the
    /// window at `tm`.
    pub fn commit(&mut self, medium: Option<&mut dyn Medium>, tm: Time) {
        if self.write_start.is_never() || tm == self.write_start {
            return;
        }
        if let Some(medium) = medium {
            medium.write_flux(self.write_start, tm, &self.write_buffer);
        }
        self.write_start = tm;
        self.write_buffer.clear();
    }

    pub fn stop_writing(&mut self, medium: Option<&mut dyn Medium>, tm: Time) {
        self.commit(medium, tm);
        self.write_start = Time::NEVER;
    }
}

impl Default for Pll {
    fn default() -> Self {
        Self::new()
    }
}
