//! Output signal ports.
//!
//! Chips expose their output pins (interrupt, DMA request, head load) as
//! `OutputLine`s. The embedding machine connects a handler to each line it
//! cares about; the chip only ever sets the level. Handlers fire on level
//! changes, never on repeated writes of the same level.

use std::fmt;

/// A single output pin with an optional change handler.
#[derive(Default)]
pub struct OutputLine {
    level: bool,
    handler: Option<Box<dyn FnMut(bool)>>,
}

impl OutputLine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a handler. Replaces any previous one.
    pub fn connect(&mut self, handler: impl FnMut(bool) + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub fn disconnect(&mut self) {
        self.handler = None;
    }

    /// Drive the line. Returns true if the level changed.
    pub fn set(&mut self, level: bool) -> bool {
        if level == self.level {
            return false;
        }
        self.level = level;
        if let Some(handler) = self.handler.as_mut() {
            handler(level);
        }
        true
    }

    #[must_use]
    pub fn level(&self) -> bool {
        self.level
    }
}

impl fmt::Debug for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputLine")
            .field("level", &self.level)
            .field("connected", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn handler_sees_edges_only() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut line = OutputLine::new();
        line.connect(move |level| sink.borrow_mut().push(level));

        assert!(line.set(true));
        assert!(!line.set(true), "same level is not a change");
        assert!(line.set(false));

        assert_eq!(*seen.borrow(), vec![true, false]);
        assert!(!line.level());
    }

    #[test]
    fn unconnected_line_tracks_level() {
        let mut line = OutputLine::new();
        line.set(true);
        assert!(line.level());
    }
}
