//! Generic reusable-id pool.
//!
//! Maps small integer ids to resources. Ids are recycled after `free`, and a
//! `get` or `free` on an id that is not live fails instead of handing back a
//! stale resource.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("id {0} is not allocated")]
    NotFound(u32),
    #[error("id space exhausted")]
    Exhausted,
}

#[derive(Debug)]
pub struct Allocator<T> {
    entries: HashMap<u32, T>,
    released: Vec<u32>,
    next: u32,
}

impl<T> Default for Allocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Allocator<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            released: Vec::new(),
            next: 0,
        }
    }

    /// Store `value` under a fresh id, reusing released ids first.
    pub fn alloc(&mut self, value: T) -> Result<u32, AllocatorError> {
        let id = match self.released.pop() {
            Some(id) => id,
            None => {
                let id = self.next;
                self.next = self.next.checked_add(1).ok_or(AllocatorError::Exhausted)?;
                id
            }
        };
        self.entries.insert(id, value);
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<&T, AllocatorError> {
        self.entries.get(&id).ok_or(AllocatorError::NotFound(id))
    }

    /// Remove and return the resource. Freeing twice is an error.
    pub fn free(&mut self, id: u32) -> Result<T, AllocatorError> {
        let value = self
            .entries
            .remove(&id)
            .ok_or(AllocatorError::NotFound(id))?;
        self.released.push(id);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything at once and reset the id space.
    pub fn drain(&mut self) -> Vec<T> {
        self.released.clear();
        self.next = 0;
        self.entries.drain().map(|(_, value)| value).collect()
    }
}
