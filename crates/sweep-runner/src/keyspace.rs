//! Fixed-length candidate enumeration over an ordered alphabet.
//!
//! An index is read as a base-`|alphabet|` number with `length` digits, most
//! significant digit first, so index order matches lexicographic order over
//! the alphabet's own ordering (`aa, ab, ba, bb` for `ab`, length 2).

use std::collections::BTreeSet;

use crate::error::{SweepError, SweepResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    alphabet: Vec<char>,
    length: usize,
    total: u64,
}

impl Keyspace {
    pub fn new(alphabet: &str, length: usize) -> SweepResult<Self> {
        let symbols: Vec<char> = alphabet.chars().collect();
        if symbols.is_empty() {
            return Err(SweepError::Config("alphabet must not be empty".to_string()));
        }
        if length == 0 {
            return Err(SweepError::Config(
                "combination_length must be at least 1".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for c in &symbols {
            if !seen.insert(*c) {
                return Err(SweepError::Config(format!(
                    "alphabet contains duplicate symbol '{}'",
                    c
                )));
            }
        }
        let total = u32::try_from(length)
            .ok()
            .and_then(|exp| (symbols.len() as u64).checked_pow(exp))
            .ok_or_else(|| {
                SweepError::Config(format!(
                    "keyspace {}^{} does not fit in 64 bits",
                    symbols.len(),
                    length
                ))
            })?;
        Ok(Self {
            alphabet: symbols,
            length,
            total,
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn alphabet(&self) -> &[char] {
        &self.alphabet
    }

    /// Candidate at `index`, or `None` past the end of the keyspace.
    pub fn nth(&self, index: u64) -> Option<String> {
        if index >= self.total {
            return None;
        }
        let base = self.alphabet.len() as u64;
        let mut digits = vec![self.alphabet[0]; self.length];
        let mut rem = index;
        for slot in digits.iter_mut().rev() {
            *slot = self.alphabet[(rem % base) as usize];
            rem /= base;
        }
        Some(digits.into_iter().collect())
    }

    pub fn index_of(&self, candidate: &str) -> Option<u64> {
        let base = self.alphabet.len() as u64;
        let mut index: u64 = 0;
        let mut count = 0usize;
        for c in candidate.chars() {
            if count == self.length {
                return None;
            }
            let digit = self.alphabet.iter().position(|a| *a == c)? as u64;
            index = index * base + digit;
            count += 1;
        }
        (count == self.length).then_some(index)
    }

    pub fn iter_from(&self, start: u64) -> KeyspaceIter<'_> {
        KeyspaceIter {
            keyspace: self,
            next: start,
        }
    }
}

/// Lazy `(index, candidate)` sequence; restart by calling `iter_from` again.
#[derive(Debug, Clone)]
pub struct KeyspaceIter<'a> {
    keyspace: &'a Keyspace,
    next: u64,
}

impl KeyspaceIter<'_> {
    pub fn position(&self) -> u64 {
        self.next
    }
}

impl Iterator for KeyspaceIter<'_> {
    type Item = (u64, String);

    fn next(&mut self) -> Option<Self::Item> {
        let candidate = self.keyspace.nth(self.next)?;
        let index = self.next;
        self.next += 1;
        Some((index, candidate))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.keyspace.total.saturating_sub(self.next);
        match usize::try_from(remaining) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}
