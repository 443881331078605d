//! Core traits and types shared by the floppy subsystem crates.
//!
//! Time is absolute and measured in picoseconds. Chips are driven by the
//! embedding scheduler; they never keep a clock of their own.

mod line;
mod medium;
mod observable;
mod time;

pub use line::OutputLine;
pub use medium::Medium;
pub use observable::{Observable, Value};
pub use time::Time;
