//! Deduplicating string table.
//!
//! Every textual field in the report is an index into one shared table, so
//! repeated paths and function names cost one entry no matter how many
//! frames reference them. Index 0 is always the empty string; "no value"
//! fields point there.

use std::collections::HashMap;

pub struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        let mut table = Self { strings: Vec::new(), index: HashMap::new() };
        table.intern("");
        table
    }

    /// Return the index of `s`, inserting it if unseen. Idempotent.
    pub fn intern(&mut self, s: &str) -> usize {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len();
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }

    /// Intern an optional string, mapping `None` to the empty entry.
    pub fn intern_opt(&mut self, s: Option<&str>) -> usize {
        match s {
            Some(s) => self.intern(s),
            None => 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        self.strings
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}
