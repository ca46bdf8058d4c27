use super::*;

/// Whether a handle refers to the buffer table or the image table
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RenderGraphResourceType {
    Buffer,
    Image,
}

/// Read/write counters that together version a resource. Every write bumps `write_count`,
/// every read bumps `read_count`. A handle snapshots these at declaration so later accesses
/// can detect that the resource was rewritten underneath it.
///
/// Counters saturate at `u8::MAX` instead of wrapping. A saturated counter means the frame's
/// declarations can no longer be versioned and the builder latches an error for the next
/// compile.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub struct RenderGraphGeneration {
    pub(super) read_count: u8,
    pub(super) write_count: u8,
}

impl RenderGraphGeneration {
    /// Returns false if the counter was already saturated
    #[must_use]
    pub(super) fn bump_read(&mut self) -> bool {
        if self.read_count == u8::MAX {
            return false;
        }
        self.read_count += 1;
        true
    }

    #[must_use]
    pub(super) fn bump_write(&mut self) -> bool {
        if self.write_count == u8::MAX {
            return false;
        }
        self.write_count += 1;
        true
    }

    pub(super) fn retire_write(&mut self) {
        debug_assert!(self.write_count > 0);
        self.write_count = self.write_count.saturating_sub(1);
    }
}

/// Lightweight handle to a declared resource: table index plus a generation snapshot.
/// Identity is (type, index) only; the generation exists purely for staleness checks.
#[derive(Clone, Copy, Debug)]
pub struct RenderGraphResourceRef {
    pub(super) resource_type: RenderGraphResourceType,
    pub(super) index: usize,
    pub(super) generation: RenderGraphGeneration,
}

impl RenderGraphResourceRef {
    pub fn is_buffer(&self) -> bool {
        self.resource_type == RenderGraphResourceType::Buffer
    }

    pub fn is_image(&self) -> bool {
        self.resource_type == RenderGraphResourceType::Image
    }
}

impl PartialEq for RenderGraphResourceRef {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.resource_type == other.resource_type && self.index == other.index
    }
}

impl Eq for RenderGraphResourceRef {}

impl std::hash::Hash for RenderGraphResourceRef {
    fn hash<H: std::hash::Hasher>(
        &self,
        state: &mut H,
    ) {
        self.resource_type.hash(state);
        self.index.hash(state);
    }
}

/// Unique ID for a particular usage (read or write) of a resource by a node. Indexes the
/// builder's usage arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RenderGraphUsageId(pub(super) usize);

/// One declared use of a resource by a node.
///
/// For a write, `resource.generation.write_count` holds the count *before* the write bumped
/// it, which is the generation the write consumed. For a read it holds the count at read
/// time, which is the generation the read observes.
#[derive(Clone, Debug)]
pub struct RenderGraphResourceUsage {
    pub(super) node: RenderGraphNodeId,
    pub(super) resource: RenderGraphResourceRef,
    pub(super) is_write: bool,
    pub(super) state: OnyxResourceState,
    pub(super) stages: OnyxPipelineStageFlags,
    /// Chronologically next usage touching the same physical storage, filled in during
    /// execute once the schedule is final. An index, never a pointer, so table growth
    /// cannot invalidate it.
    pub(super) next_use: Option<RenderGraphUsageId>,
}

/// The range of scheduled-node indices across which a resource is live
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct RenderGraphNodeRange {
    pub(super) first_write: Option<usize>,
    pub(super) last_write: Option<usize>,
    pub(super) first_read: Option<usize>,
    pub(super) last_read: Option<usize>,
}

impl RenderGraphNodeRange {
    pub(super) fn add_write(
        &mut self,
        node_index: usize,
    ) {
        self.first_write = Some(self.first_write.map_or(node_index, |n| n.min(node_index)));
        self.last_write = Some(self.last_write.map_or(node_index, |n| n.max(node_index)));
    }

    pub(super) fn add_read(
        &mut self,
        node_index: usize,
    ) {
        self.first_read = Some(self.first_read.map_or(node_index, |n| n.min(node_index)));
        self.last_read = Some(self.last_read.map_or(node_index, |n| n.max(node_index)));
    }

    pub fn has_writer(&self) -> bool {
        self.first_write.is_some()
    }

    pub fn has_reader(&self) -> bool {
        self.first_read.is_some()
    }

    pub fn is_used(&self) -> bool {
        self.has_writer() || self.has_reader()
    }

    pub fn first_used_node(&self) -> Option<usize> {
        match (self.first_write, self.first_read) {
            (Some(w), Some(r)) => Some(w.min(r)),
            (w, r) => w.or(r),
        }
    }

    pub fn last_used_node(&self) -> Option<usize> {
        match (self.last_write, self.last_read) {
            (Some(w), Some(r)) => Some(w.max(r)),
            (w, r) => w.or(r),
        }
    }

    /// True when neither range contains a node index of the other. Unused ranges are
    /// trivially disjoint.
    pub fn disjoint_with(
        &self,
        other: &RenderGraphNodeRange,
    ) -> bool {
        match (
            self.first_used_node(),
            self.last_used_node(),
            other.first_used_node(),
            other.last_used_node(),
        ) {
            (Some(a0), Some(a1), Some(b0), Some(b1)) => a1 < b0 || b1 < a0,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_saturates() {
        let mut gen = RenderGraphGeneration::default();
        for _ in 0..255 {
            assert!(gen.bump_write());
        }
        assert_eq!(gen.write_count, u8::MAX);
        assert!(!gen.bump_write());
        assert_eq!(gen.write_count, u8::MAX);
    }

    #[test]
    fn node_range_bounds() {
        let mut range = RenderGraphNodeRange::default();
        assert!(!range.is_used());
        range.add_write(3);
        range.add_read(5);
        range.add_read(1);
        assert_eq!(range.first_used_node(), Some(1));
        assert_eq!(range.last_used_node(), Some(5));
    }

    #[test]
    fn node_range_disjoint() {
        let mut a = RenderGraphNodeRange::default();
        a.add_write(0);
        a.add_read(2);

        let mut b = RenderGraphNodeRange::default();
        b.add_write(3);
        b.add_read(5);
        assert!(a.disjoint_with(&b));
        assert!(b.disjoint_with(&a));

        let mut c = RenderGraphNodeRange::default();
        c.add_write(2);
        c.add_read(5);
        assert!(!a.disjoint_with(&c));
    }
}
