//! Byte-range lock bookkeeping for one server handle.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeLockEntry {
    pub offset: u64,
    pub length: u64,
    /// Process that issued the lock call.
    pub locking_pid: u32,
    /// Process that owns the lock; unlock must name the same owner.
    pub owner_pid: u32,
    pub exclusive: bool,
}

impl ByteRangeLockEntry {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Zero-length ranges only collide with an identical zero-length range.
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        if self.length == 0 || length == 0 {
            return self.offset == offset && self.length == length;
        }
        self.offset < offset.saturating_add(length) && offset < self.end()
    }

    pub fn matches(&self, offset: u64, length: u64, owner_pid: u32) -> bool {
        self.offset == offset && self.length == length && self.owner_pid == owner_pid
    }
}

/// Locks granted on one handle, kept ordered by range start.
#[derive(Debug, Clone, Default)]
pub struct ByteRangeLockTable {
    entries: Vec<ByteRangeLockEntry>,
}

impl ByteRangeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRangeLockEntry> {
        self.entries.iter()
    }

    /// Whether a new lock would collide with one already held here.
    pub fn conflicts(&self, offset: u64, length: u64, exclusive: bool) -> bool {
        self.entries
            .iter()
            .any(|e| e.overlaps(offset, length) && (e.exclusive || exclusive))
    }

    pub fn insert(&mut self, entry: ByteRangeLockEntry) {
        let pos = self
            .entries
            .partition_point(|e| (e.offset, e.length) <= (entry.offset, entry.length));
        self.entries.insert(pos, entry);
    }

    pub fn find_exact(&self, offset: u64, length: u64, owner_pid: u32) -> Option<&ByteRangeLockEntry> {
        self.entries.iter().find(|e| e.matches(offset, length, owner_pid))
    }

    pub fn remove_exact(
        &mut self,
        offset: u64,
        length: u64,
        owner_pid: u32,
    ) -> Option<ByteRangeLockEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.matches(offset, length, owner_pid))?;
        Some(self.entries.remove(pos))
    }

    /// Drop every entry; the server released them when the handle closed.
    pub fn clear(&mut self) -> Vec<ByteRangeLockEntry> {
        std::mem::take(&mut self.entries)
    }
}
