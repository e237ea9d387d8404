//! Fixed-capacity capture buffers for child output
//!
//! Output read from a child's pipe lands in a chain of fixed-size chunks.
//! Appending never reallocates or moves previously captured bytes, and the
//! chain preserves the exact byte sequence in arrival order.

/// Capacity of a single capture chunk.
pub(crate) const CHUNK_CAPACITY: usize = 64 * 1024;

/// One fixed-capacity capture chunk.
pub(crate) struct OutputChunk {
    data: Box<[u8]>,
    used: usize,
}

impl OutputChunk {
    fn new() -> Self {
        Self {
            data: vec![0u8; CHUNK_CAPACITY].into_boxed_slice(),
            used: 0,
        }
    }

    fn available(&self) -> usize {
        CHUNK_CAPACITY - self.used
    }

    fn used(&self) -> usize {
        self.used
    }

    /// The writable region starting at `used`. Empty when the chunk is full.
    fn spare_capacity_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    /// Mark `n` bytes of the region handed out by `spare_capacity_mut` as
    /// captured. Committing more than the region held is a contract bug.
    fn commit(&mut self, n: usize) {
        assert!(n <= self.available(), "committed past the end of a chunk");
        self.used += n;
    }

    /// Copy the captured bytes into `dest`, returning how many were copied.
    fn copy_to(&self, dest: &mut [u8]) -> usize {
        dest[..self.used].copy_from_slice(&self.data[..self.used]);
        self.used
    }
}

/// An append-only chain of capture chunks for one stream.
pub(crate) struct ChunkChain {
    chunks: Vec<OutputChunk>,
}

impl ChunkChain {
    pub(crate) fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// A write region in the last chunk, appending a fresh chunk when the
    /// chain is empty or the last chunk is full.
    pub(crate) fn alloc(&mut self) -> &mut [u8] {
        if self.chunks.last().map_or(true, |c| c.available() == 0) {
            self.chunks.push(OutputChunk::new());
        }
        self.chunks
            .last_mut()
            .expect("chain has a chunk after alloc")
            .spare_capacity_mut()
    }

    /// Commit `n` bytes into the region most recently returned by `alloc`.
    pub(crate) fn commit(&mut self, n: usize) {
        self.chunks
            .last_mut()
            .expect("commit without a preceding alloc")
            .commit(n);
    }

    /// Total number of captured bytes across the chain.
    pub(crate) fn total_len(&self) -> usize {
        self.chunks.iter().map(OutputChunk::used).sum()
    }

    /// The captured bytes as one contiguous buffer, in arrival order.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_len()];
        let mut offset = 0;
        for chunk in &self.chunks {
            offset += chunk.copy_to(&mut out[offset..]);
        }
        out
    }
}
