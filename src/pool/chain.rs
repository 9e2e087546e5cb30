use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::memory::{Memory, TargetReader};

/// Walks a singly linked queue threaded through target memory.
///
/// The first word of every entry holds the address of the next entry, `0` ends the queue. The
/// walk yields at most `max_steps` entries and never visits an entry twice; either violation
/// yields a [`Error::CorruptPool`] and ends the walk.
pub struct Chain<'a, M: ?Sized> {
    reader: TargetReader<'a, M>,
    pool: &'a str,
    next: u64,
    remaining: u64,
    visited: HashSet<u64>,
    done: bool,
}

impl<'a, M: Memory + ?Sized> Chain<'a, M> {
    pub fn new(reader: TargetReader<'a, M>, pool: &'a str, head: u64, max_steps: u64) -> Self {
        Self {
            reader,
            pool,
            next: head,
            remaining: max_steps,
            visited: HashSet::new(),
            done: false,
        }
    }

    fn corrupt(&mut self, address: u64, reason: &'static str) -> Option<Result<u64>> {
        self.done = true;
        let error = Error::CorruptPool {
            pool: self.pool.to_string(),
            address,
            reason,
        };
        tracing::warn!(%error, "pool queue walk aborted");
        Some(Err(error))
    }
}

impl<M: Memory + ?Sized> Iterator for Chain<'_, M> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next == 0 {
            return None;
        }

        let entry = self.next;
        if self.remaining == 0 {
            return self.corrupt(entry, "queue longer than the pool capacity");
        }
        if !self.visited.insert(entry) {
            return self.corrupt(entry, "queue links back to a visited entry");
        }
        self.remaining -= 1;

        match self.reader.word(entry) {
            Ok(link) => {
                self.next = link;
                Some(Ok(entry))
            }
            Err(error) => {
                tracing::warn!(%error, pool = self.pool, entry, "cannot read pool queue link");
                self.done = true;
                Some(Err(error))
            }
        }
    }
}
