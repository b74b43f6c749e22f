//! Binary-operator precedence table.
//!
//! The parser reads it to drive precedence climbing; code generation writes
//! it when a `def binary...` installs a new operator, and rolls that write
//! back when the definition fails to compile.

use rustc_hash::FxHashMap;

/// Precedence used when a `binary` prototype omits one.
pub const DEFAULT_BINARY_PRECEDENCE: u32 = 30;

/// Lowest and highest precedence a user declaration may request.
pub const MIN_USER_PRECEDENCE: u32 = 1;
pub const MAX_USER_PRECEDENCE: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct OperatorTable {
    precedence: FxHashMap<char, i32>,
}

impl OperatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in operators; `1` is the loosest binding.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.precedence.insert('=', 2);
        table.precedence.insert('<', 10);
        table.precedence.insert('+', 20);
        table.precedence.insert('-', 20);
        table.precedence.insert('*', 40);
        table
    }

    /// Precedence of a declared binary operator. Entries at or below zero
    /// do not count as declared.
    pub fn precedence(&self, op: char) -> Option<i32> {
        self.precedence
            .get(&op)
            .copied()
            .filter(|precedence| *precedence > 0)
    }

    /// Inserts or overwrites an entry and hands back what was there before,
    /// so the caller can undo the change with [`OperatorTable::restore`].
    pub fn install(&mut self, op: char, precedence: u32) -> Option<i32> {
        let precedence = i32::try_from(precedence).unwrap_or(i32::MAX);
        self.precedence.insert(op, precedence)
    }

    pub fn restore(&mut self, op: char, previous: Option<i32>) {
        match previous {
            Some(precedence) => {
                self.precedence.insert(op, precedence);
            }
            None => {
                self.precedence.remove(&op);
            }
        }
    }
}
