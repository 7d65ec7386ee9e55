use std::fmt;

use crate::logging;

pub const DEFAULT_ALIGN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    OutOfArena {
        arena: &'static str,
        requested: usize,
        remaining: usize,
    },
    InvalidAlignment(usize),
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::OutOfArena {
                arena,
                requested,
                remaining,
            } => write!(
                f,
                "{} arena exhausted: requested {} bytes, {} remaining",
                arena, requested, remaining
            ),
            ArenaError::InvalidAlignment(align) => {
                write!(f, "alignment must be a power of two, got {}", align)
            }
        }
    }
}

impl std::error::Error for ArenaError {}

/// Location of an allocation inside the arena that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaRange {
    offset: usize,
    len: usize,
}

impl ArenaRange {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// A saved cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaMark(usize);

/// Fixed-capacity bump allocator. Individual allocations are never freed;
/// the cursor can only be rolled back to an earlier [`ArenaMark`].
///
/// Ranges handed out after a mark become stale once the arena is released
/// to that mark. Reading them afterwards is memory safe but yields whatever
/// later allocations wrote there.
#[derive(Debug)]
pub struct Arena {
    name: &'static str,
    memory: Vec<u8>,
    cursor: usize,
}

impl Arena {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            memory: vec![0u8; capacity],
            cursor: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.memory.len() - self.cursor
    }

    pub fn allocate(&mut self, size: usize) -> Result<ArenaRange, ArenaError> {
        self.allocate_aligned(size, DEFAULT_ALIGN)
    }

    /// Allocates `size` zeroed bytes whose offset is a multiple of `align`.
    /// On failure the cursor is left where it was.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<ArenaRange, ArenaError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment(align));
        }
        let exhausted = || ArenaError::OutOfArena {
            arena: self.name,
            requested: size,
            remaining: self.memory.len() - self.cursor,
        };
        let start = self
            .cursor
            .checked_add(align - 1)
            .map(|value| value & !(align - 1))
            .ok_or_else(exhausted)?;
        let end = start.checked_add(size).ok_or_else(exhausted)?;
        if end > self.memory.len() {
            return Err(exhausted());
        }
        self.memory[start..end].fill(0);
        self.cursor = end;
        Ok(ArenaRange { offset: start, len: size })
    }

    /// Allocates a copy of `data`.
    pub fn push_bytes(&mut self, data: &[u8]) -> Result<ArenaRange, ArenaError> {
        let range = self.allocate(data.len())?;
        self.bytes_mut(range).copy_from_slice(data);
        Ok(range)
    }

    pub fn mark(&self) -> ArenaMark {
        ArenaMark(self.cursor)
    }

    /// Everything allocated since `mark`, as one range. Empty when the
    /// cursor is at or below the mark.
    pub fn range_since(&self, mark: ArenaMark) -> ArenaRange {
        let start = mark.0.min(self.cursor);
        ArenaRange {
            offset: start,
            len: self.cursor - start,
        }
    }

    pub fn release_to(&mut self, mark: ArenaMark) {
        if mark.0 > self.cursor {
            logging::debug(format!(
                "{} arena: ignoring release to {} above cursor {}",
                self.name, mark.0, self.cursor
            ));
            return;
        }
        self.cursor = mark.0;
    }

    pub fn bytes(&self, range: ArenaRange) -> &[u8] {
        &self.memory[range.offset..range.end()]
    }

    pub fn bytes_mut(&mut self, range: ArenaRange) -> &mut [u8] {
        &mut self.memory[range.offset..range.end()]
    }

    /// Borrows one range for reading and a disjoint one for writing.
    /// Returns `None` when the ranges overlap.
    pub fn split_pair(&mut self, read: ArenaRange, write: ArenaRange) -> Option<(&[u8], &mut [u8])> {
        if read.end() <= write.offset {
            let (head, tail) = self.memory.split_at_mut(write.offset);
            Some((&head[read.offset..read.end()], &mut tail[..write.len]))
        } else if write.end() <= read.offset {
            let (head, tail) = self.memory.split_at_mut(read.offset);
            Some((&tail[..read.len], &mut head[write.offset..write.end()]))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let mut arena = Arena::new("test", 64);
        let a = arena.allocate(3).expect("alloc a");
        arena.bytes_mut(a).copy_from_slice(&[1, 2, 3]);
        let b = arena.allocate(4).expect("alloc b");
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 8);
        assert_eq!(arena.bytes(b), &[0, 0, 0, 0]);
        assert_eq!(arena.used(), 12);
        assert_eq!(arena.remaining(), 52);
    }

    #[test]
    fn exhaustion_leaves_cursor_unchanged() {
        let mut arena = Arena::new("test", 16);
        arena.allocate(10).expect("first");
        let err = arena.allocate(8).expect_err("should overflow");
        assert!(matches!(
            err,
            ArenaError::OutOfArena {
                requested: 8,
                remaining: 6,
                ..
            }
        ));
        assert_eq!(arena.used(), 10);
        assert!(arena.allocate(usize::MAX).is_err());
        assert_eq!(arena.used(), 10);
    }

    #[test]
    fn release_to_mark_reclaims_space() {
        let mut arena = Arena::new("test", 32);
        arena.allocate(8).expect("keep");
        let mark = arena.mark();
        arena.allocate(16).expect("transient");
        assert_eq!(arena.remaining(), 8);
        arena.release_to(mark);
        assert_eq!(arena.used(), 8);
        let again = arena.allocate(16).expect("reuse");
        assert_eq!(arena.bytes(again), &[0u8; 16]);
    }

    #[test]
    fn release_above_cursor_is_ignored() {
        let mut arena = Arena::new("test", 32);
        arena.allocate(16).expect("alloc");
        let mark = arena.mark();
        arena.release_to(ArenaMark(0));
        arena.release_to(mark);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn rejects_bad_alignment() {
        let mut arena = Arena::new("test", 32);
        assert_eq!(
            arena.allocate_aligned(4, 3),
            Err(ArenaError::InvalidAlignment(3))
        );
        let range = arena.allocate_aligned(4, 1).expect("byte aligned");
        assert_eq!(range.offset(), 0);
    }

    #[test]
    fn split_pair_borrows_disjoint_ranges() {
        let mut arena = Arena::new("test", 32);
        let src = arena.push_bytes(&[7, 8]).expect("src");
        let dst = arena.allocate(2).expect("dst");
        let (read, write) = arena.split_pair(src, dst).expect("disjoint");
        write.copy_from_slice(read);
        assert_eq!(arena.bytes(dst), &[7, 8]);
        assert!(arena.split_pair(src, src).is_none());
    }

    #[test]
    fn range_since_spans_later_allocations() {
        let mut arena = Arena::new("test", 64);
        arena.allocate(3).expect("before");
        let mark = arena.mark();
        let a = arena.push_bytes(&[1, 2]).expect("a");
        let b = arena.push_bytes(&[3]).expect("b");
        let span = arena.range_since(mark);
        assert_eq!(span.offset(), 3);
        assert_eq!(span.offset() + span.len(), b.offset() + b.len());
        assert_eq!(arena.bytes(span)[a.offset() - 3..][..2], [1, 2]);
        arena.release_to(mark);
        assert!(arena.range_since(mark).is_empty());
    }
}
