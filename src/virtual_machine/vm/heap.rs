use crate::virtual_machine::errors::VMError;
use std::ops::Range;

/// Fixed-size arena backing one VM instance.
///
/// The memory is reserved once when the arena is allocated and reused by every
/// VM instance afterwards; [`reset`](Heap::reset) only rewinds the bump
/// pointer. Task bytecode is copied into the arena at task creation.
pub struct Heap {
    memory: Vec<u8>,
    used: usize,
}

impl Heap {
    /// Reserves an arena of `size` bytes, failing instead of aborting on OOM.
    pub fn allocate(size: usize) -> Result<Self, VMError> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| VMError::HeapAllocation(size))?;
        memory.resize(size, 0);
        Ok(Self { memory, used: 0 })
    }

    /// Copies `data` into the arena and returns its location.
    pub fn alloc(&mut self, data: &[u8]) -> Result<Range<usize>, VMError> {
        let free = self.free();
        if data.len() > free {
            return Err(VMError::HeapExhausted {
                requested: data.len(),
                free,
            });
        }
        let range = self.used..self.used + data.len();
        self.memory[range.clone()].copy_from_slice(data);
        self.used = range.end;
        Ok(range)
    }

    /// Returns the bytes of a previous allocation.
    pub fn get(&self, range: Range<usize>) -> &[u8] {
        self.memory.get(range).unwrap_or(&[])
    }

    /// Releases every allocation.
    pub fn reset(&mut self) {
        self.memory[..self.used].fill(0);
        self.used = 0;
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.memory.len() - self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_copies_and_advances() {
        let mut heap = Heap::allocate(16).unwrap();
        let a = heap.alloc(b"abc").unwrap();
        let b = heap.alloc(b"defg").unwrap();
        assert_eq!(a, 0..3);
        assert_eq!(b, 3..7);
        assert_eq!(heap.get(b), b"defg");
        assert_eq!(heap.free(), 9);
    }

    #[test]
    fn exhausted_heap_rejects_allocation() {
        let mut heap = Heap::allocate(8).unwrap();
        heap.alloc(&[1; 6]).unwrap();
        assert_eq!(
            heap.alloc(&[2; 3]),
            Err(VMError::HeapExhausted {
                requested: 3,
                free: 2
            })
        );
    }

    #[test]
    fn reset_reclaims_the_whole_arena() {
        let mut heap = Heap::allocate(8).unwrap();
        heap.alloc(&[1; 8]).unwrap();
        heap.reset();
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.capacity(), 8);
        assert_eq!(heap.alloc(&[3; 8]), Ok(0..8));
    }

    #[test]
    fn impossible_size_fails_gracefully() {
        assert_eq!(
            Heap::allocate(usize::MAX).err(),
            Some(VMError::HeapAllocation(usize::MAX))
        );
    }
}
