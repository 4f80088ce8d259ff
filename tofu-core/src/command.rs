//! Keystroke interpretation.
//!
//! Single keys fire immediately; a parameterized prefix (or a bare digit)
//! starts a pending command that collects digits until Enter.

use std::collections::HashMap;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Escape,
    Backspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterState {
    Idle,
    Accumulating,
}

/// Which key produces which action.
///
/// Digit keys always feed the pending count, so binding one has no effect.
pub struct Bindings<A> {
    immediate: HashMap<char, A>,
    parameterized: HashMap<char, fn(usize) -> A>,
    bare_count: Option<char>,
}

impl<A> Default for Bindings<A> {
    fn default() -> Self {
        Self {
            immediate: HashMap::new(),
            parameterized: HashMap::new(),
            bare_count: None,
        }
    }
}

impl<A> Bindings<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a zero-argument action. Replaces any earlier binding of `key`.
    pub fn immediate(mut self, key: char, action: A) -> Self {
        self.parameterized.remove(&key);
        self.immediate.insert(key, action);
        self
    }

    /// Binds a one-argument action entered as `key`, digits, Enter.
    pub fn parameterized(mut self, key: char, action: fn(usize) -> A) -> Self {
        self.immediate.remove(&key);
        self.parameterized.insert(key, action);
        self
    }

    /// Treats digits typed without a prefix as if `key` had been typed first.
    pub fn bare_count(mut self, key: char) -> Self {
        self.bare_count = Some(key);
        self
    }

    fn starts_command(&self, c: char) -> bool {
        c.is_ascii_digit() || self.parameterized.contains_key(&c)
    }
}

pub struct CommandInterpreter<A> {
    bindings: Bindings<A>,
    pending: String,
}

impl<A: Clone> CommandInterpreter<A> {
    pub fn new(bindings: Bindings<A>) -> Self {
        Self {
            bindings,
            pending: String::new(),
        }
    }

    pub fn state(&self) -> InterpreterState {
        if self.pending.is_empty() {
            InterpreterState::Idle
        } else {
            InterpreterState::Accumulating
        }
    }

    /// The command typed so far, for display.
    pub fn pending(&self) -> Option<&str> {
        if self.pending.is_empty() {
            None
        } else {
            Some(&self.pending)
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Feeds one keystroke, returning the action it completes, if any.
    pub fn feed(&mut self, key: Key) -> Option<A> {
        match self.state() {
            InterpreterState::Idle => self.feed_idle(key),
            InterpreterState::Accumulating => self.feed_accumulating(key),
        }
    }

    fn feed_idle(&mut self, key: Key) -> Option<A> {
        match key {
            Key::Char(c) if self.bindings.starts_command(c) => {
                self.pending.push(c);
                None
            }
            Key::Char(c) => self.bindings.immediate.get(&c).cloned(),
            Key::Enter | Key::Escape | Key::Backspace => None,
        }
    }

    fn feed_accumulating(&mut self, key: Key) -> Option<A> {
        match key {
            Key::Char(c) if c.is_ascii_digit() => {
                self.pending.push(c);
                None
            }
            Key::Enter => self.confirm(),
            Key::Escape => {
                self.reset();
                None
            }
            Key::Backspace => {
                self.pending.pop();
                None
            }
            Key::Char(c) => {
                debug!(pending = %self.pending, key = %c, "abandoning pending command");
                self.reset();
                self.feed_idle(key)
            }
        }
    }

    fn confirm(&mut self) -> Option<A> {
        let pending = std::mem::take(&mut self.pending);
        let mut chars = pending.chars();
        let (command, digits) = match chars.next() {
            Some(c) if c.is_ascii_digit() => (self.bindings.bare_count?, pending.as_str()),
            Some(c) => (c, chars.as_str()),
            None => return None,
        };
        if digits.is_empty() {
            debug!(%command, "command confirmed without a count");
            return None;
        }
        let action = self.bindings.parameterized.get(&command)?;
        Some(action(parse_count(digits)))
    }
}

fn parse_count(digits: &str) -> usize {
    digits.bytes().fold(0usize, |acc, b| {
        acc.saturating_mul(10)
            .saturating_add(usize::from(b.wrapping_sub(b'0')))
    })
}
