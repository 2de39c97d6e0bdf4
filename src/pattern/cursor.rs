//! Bidirectional cursor over pattern values

use std::sync::Arc;

use crate::{Error, Result};

/// Walks a pattern forwards and, when looping, back again.
///
/// Looping traversal ping-pongs without repeating the endpoints, so a pattern
/// `[a, b, c]` plays `a b c b a b c ...` with period `2L - 2`. A single value
/// pattern repeats that value.
#[derive(Debug, Clone)]
pub struct PatternCursor {
    values: Arc<[f64]>,
    position: Option<usize>,
    forward: bool,
    looping: bool,
    done: bool,
}

impl PatternCursor {
    pub fn new(values: Arc<[f64]>, looping: bool) -> Self {
        Self { values, position: None, forward: true, looping, done: false }
    }

    /// Advance and return the value at the new position.
    ///
    /// A non-looping cursor over `L` values succeeds exactly `L` times and
    /// then returns [`Error::PatternExhausted`] on every call.
    pub fn next(&mut self) -> Result<f64> {
        if self.done || self.values.is_empty() {
            return Err(Error::PatternExhausted);
        }
        let last = self.values.len() - 1;

        let next = match self.position {
            None => 0,
            Some(p) if self.forward && p < last => p + 1,
            Some(p) if !self.forward && p > 0 => p - 1,
            Some(p) => {
                if !self.looping {
                    self.done = true;
                    return Err(Error::PatternExhausted);
                }
                if last == 0 {
                    p
                } else {
                    self.forward = !self.forward;
                    if self.forward { p + 1 } else { p - 1 }
                }
            }
        };

        self.position = Some(next);
        Ok(self.values[next])
    }

    /// Current value without advancing; the first value before any `next()`.
    pub fn value(&self) -> f64 {
        let index = self.position.unwrap_or(0);
        self.values.get(index).copied().unwrap_or_default()
    }

    /// Index of the current value, `None` before the first `next()`.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Whether `next()` will keep failing until a `reset()`.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Stop playback: turn looping off and make every further `next()` fail.
    pub fn set_done(&mut self) {
        self.looping = false;
        self.forward = true;
        self.done = true;
    }

    /// Back to the start, moving forward.
    pub fn reset(&mut self) {
        self.position = None;
        self.forward = true;
        self.done = false;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Iterator for PatternCursor {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        PatternCursor::next(self).ok()
    }
}
