//! Linear state arena.
//!
//! One zero-initialised byte buffer holds all script-visible state. The first
//! `stack_size` bytes form a stack that grows upwards from address 0; the
//! remaining `memory_size` bytes are managed by a first-fit allocator.
//!
//! Every access is checked against the total capacity. Loads and stores do
//! not consult allocator bookkeeping: any in-capacity byte may be read or
//! written, just like raw memory, but nothing outside the buffer is ever
//! reachable.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::Serialize;

use super::error::ArenaError;
use super::primitive::{ADDRESS_SIZE, Address, Primitive};

/// Arena sizes must be multiples of this many bytes.
pub const ARENA_ALIGNMENT: usize = 4;

type ArenaResult<T> = std::result::Result<T, ArenaError>;

/// Capacity snapshot returned by [`Arena::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaInfo {
    pub stack_capacity: usize,
    pub memory_capacity: usize,
    pub total_capacity: usize,
    pub stack_free: usize,
    pub memory_free: usize,
    pub total_free: usize,
}

#[derive(Clone)]
pub struct Arena {
    bytes: Vec<u8>,
    stack_size: usize,
    memory_size: usize,
    stack_pos: usize,
    /// Free heap blocks as `(address, size)`, sorted by address and coalesced.
    free: Vec<(Address, usize)>,
    /// Live heap blocks keyed by address.
    live: BTreeMap<Address, usize>,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Arena")
            .field("bytes", &format!("[...; {}]", self.bytes.len()))
            .field("stack_size", &self.stack_size)
            .field("memory_size", &self.memory_size)
            .field("stack_pos", &self.stack_pos)
            .field("free", &self.free)
            .field("live", &self.live.len())
            .finish()
    }
}

impl Arena {
    /// Allocate a zeroed arena. Fails instead of aborting when the total size
    /// overflows or cannot be allocated.
    pub fn new(stack_size: usize, memory_size: usize) -> ArenaResult<Self> {
        let unavailable = ArenaError::Unallocatable {
            stack: stack_size,
            memory: memory_size,
        };
        let capacity = stack_size.checked_add(memory_size).ok_or(unavailable.clone())?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).map_err(|_| unavailable)?;
        bytes.resize(capacity, 0);

        let free = if memory_size > 0 {
            vec![(stack_size, memory_size)]
        } else {
            vec![]
        };
        Ok(Self {
            bytes,
            stack_size,
            memory_size,
            stack_pos: 0,
            free,
            live: BTreeMap::new(),
        })
    }

    #[inline]
    pub fn stack_capacity(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn memory_capacity(&self) -> usize {
        self.memory_size
    }

    /// Total addressable bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Current top of the stack segment.
    #[inline]
    pub fn stack_address(&self) -> Address {
        self.stack_pos
    }

    #[inline]
    pub fn stack_free(&self) -> usize {
        self.stack_size - self.stack_pos
    }

    pub fn memory_free(&self) -> usize {
        self.free.iter().map(|(_, size)| size).sum()
    }

    pub fn info(&self) -> ArenaInfo {
        let stack_free = self.stack_free();
        let memory_free = self.memory_free();
        ArenaInfo {
            stack_capacity: self.stack_size,
            memory_capacity: self.memory_size,
            total_capacity: self.capacity(),
            stack_free,
            memory_free,
            total_free: stack_free + memory_free,
        }
    }

    // ------------------------------------------------------------------
    // Stack segment
    // ------------------------------------------------------------------

    /// Reserve `size` zeroed bytes on top of the stack.
    pub fn alloc_stack(&mut self, size: usize) -> ArenaResult<Address> {
        let available = self.stack_free();
        if size > available {
            return Err(ArenaError::OutOfStack {
                requested: size,
                available,
            });
        }
        let address = self.stack_pos;
        self.bytes[address..address + size].fill(0);
        self.stack_pos += size;
        Ok(address)
    }

    /// Push a copy of `source` on top of the stack.
    pub fn push_bytes(&mut self, source: &[u8]) -> ArenaResult<Address> {
        let address = self.alloc_stack(source.len())?;
        self.bytes[address..address + source.len()].copy_from_slice(source);
        Ok(address)
    }

    pub fn push<T: Primitive>(&mut self, value: T) -> ArenaResult<Address> {
        let address = self.alloc_stack(T::SIZE)?;
        value.write_le(&mut self.bytes[address..address + T::SIZE]);
        Ok(address)
    }

    /// Push an address cell on top of the stack.
    pub fn push_address(&mut self, value: Address) -> ArenaResult<Address> {
        self.push(value as u64)
    }

    /// Release the topmost `size` bytes of the stack.
    pub fn pop_stack(&mut self, size: usize) -> ArenaResult<()> {
        if size > self.stack_pos {
            return Err(ArenaError::StackUnderflow {
                requested: size,
                available: self.stack_pos,
            });
        }
        self.stack_pos -= size;
        Ok(())
    }

    /// Move the top of the stack to `position`, which must lie inside the
    /// stack segment.
    pub fn reset_stack(&mut self, position: usize) -> ArenaResult<()> {
        if position > self.stack_size {
            return Err(ArenaError::InvalidStackPosition {
                position,
                stack_size: self.stack_size,
            });
        }
        self.stack_pos = position;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Heap segment
    // ------------------------------------------------------------------

    /// Allocate `size` zeroed bytes from the heap segment (first fit).
    ///
    /// A zero-size request reserves one byte so that every live allocation
    /// has a distinct address.
    pub fn alloc_memory(&mut self, size: usize) -> ArenaResult<Address> {
        let size = size.max(1);
        let Some(index) = self.free.iter().position(|&(_, free)| free >= size) else {
            return Err(ArenaError::OutOfMemory {
                requested: size,
                available: self.memory_free(),
            });
        };
        let (address, free) = self.free[index];
        if free == size {
            self.free.remove(index);
        } else {
            self.free[index] = (address + size, free - size);
        }
        self.bytes[address..address + size].fill(0);
        self.live.insert(address, size);
        Ok(address)
    }

    /// Return a block obtained from [`alloc_memory`](Self::alloc_memory).
    pub fn dealloc_memory(&mut self, address: Address) -> ArenaResult<()> {
        let size = self
            .live
            .remove(&address)
            .ok_or(ArenaError::InvalidAddress(address))?;
        let index = self.free.partition_point(|&(a, _)| a < address);
        self.free.insert(index, (address, size));
        self.coalesce_around(index);
        Ok(())
    }

    /// Size of the live heap block starting at `address`, if any.
    pub fn allocation_size(&self, address: Address) -> Option<usize> {
        self.live.get(&address).copied()
    }

    fn coalesce_around(&mut self, index: usize) {
        if index + 1 < self.free.len() {
            let (a, s) = self.free[index];
            let (next_a, next_s) = self.free[index + 1];
            if a + s == next_a {
                self.free[index] = (a, s + next_s);
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_a, prev_s) = self.free[index - 1];
            let (a, s) = self.free[index];
            if prev_a + prev_s == a {
                self.free[index - 1] = (prev_a, prev_s + s);
                self.free.remove(index);
            }
        }
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    fn range(&self, address: Address, size: usize) -> ArenaResult<Range<usize>> {
        match address.checked_add(size) {
            Some(end) if end <= self.bytes.len() => Ok(address..end),
            _ => Err(ArenaError::OutOfBounds {
                address,
                size,
                capacity: self.bytes.len(),
            }),
        }
    }

    pub fn load<T: Primitive>(&self, address: Address) -> ArenaResult<T> {
        let range = self.range(address, T::SIZE)?;
        Ok(T::read_le(&self.bytes[range]))
    }

    pub fn store<T: Primitive>(&mut self, address: Address, value: T) -> ArenaResult<()> {
        let range = self.range(address, T::SIZE)?;
        value.write_le(&mut self.bytes[range]);
        Ok(())
    }

    pub fn load_bytes(&self, address: Address, size: usize) -> ArenaResult<&[u8]> {
        let range = self.range(address, size)?;
        Ok(&self.bytes[range])
    }

    pub fn store_bytes(&mut self, address: Address, value: &[u8]) -> ArenaResult<()> {
        let range = self.range(address, value.len())?;
        self.bytes[range].copy_from_slice(value);
        Ok(())
    }

    /// Copy `size` bytes from `source` to `destination`; the regions may
    /// overlap.
    pub fn copy_within(&mut self, source: Address, size: usize, destination: Address) -> ArenaResult<()> {
        let from = self.range(source, size)?;
        self.range(destination, size)?;
        self.bytes.copy_within(from, destination);
        Ok(())
    }

    pub fn load_address(&self, address: Address) -> ArenaResult<Address> {
        let value = self.load::<u64>(address)?;
        usize::try_from(value).map_err(|_| ArenaError::OutOfBounds {
            address,
            size: ADDRESS_SIZE,
            capacity: self.bytes.len(),
        })
    }

    pub fn store_address(&mut self, address: Address, value: Address) -> ArenaResult<()> {
        self.store(address, value as u64)
    }

    /// Read the NUL-terminated string whose address is stored in the cell at
    /// `address`.
    pub fn load_cstring(&self, address: Address) -> ArenaResult<String> {
        let start = self.load_address(address)?;
        let tail = self.bytes.get(start..).ok_or(ArenaError::OutOfBounds {
            address: start,
            size: 1,
            capacity: self.bytes.len(),
        })?;
        let Some(len) = tail.iter().position(|&b| b == 0) else {
            return Err(ArenaError::OutOfBounds {
                address: start,
                size: tail.len() + 1,
                capacity: self.bytes.len(),
            });
        };
        String::from_utf8(tail[..len].to_vec()).map_err(|_| ArenaError::InvalidUtf8(start))
    }

    /// Push `value` as a NUL-terminated string on the stack and store its
    /// address into the cell at `address`.
    pub fn store_cstring(&mut self, value: &str, address: Address) -> ArenaResult<()> {
        if value.as_bytes().contains(&0) {
            return Err(ArenaError::InteriorNul);
        }
        self.range(address, ADDRESS_SIZE)?;
        let mark = self.stack_pos;
        let text = self.push_bytes(value.as_bytes())?;
        if let Err(err) = self.push::<u8>(0) {
            self.stack_pos = mark;
            return Err(err);
        }
        self.store_address(address, text)
    }

    /// The whole arena as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
