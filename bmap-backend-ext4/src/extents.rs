use std::cmp::Ordering;
use std::ops::Range;

use arrayvec::ArrayVec;
use quick_error::quick_error;
use scroll::{Pread, Pwrite};

/// The magic number identifying extent trees.
pub const MAGIC: u16 = 0xF30A;

/// The size of an extent tree item, equal to both sizeof(ExtentIndex) and sizeof(ExtentLeaf).
pub const ITEM_SIZE: usize = 12;

/// The size of the tree header.
pub const HEADER_SIZE: usize = 12;

/// The number of inline item slots in the tree root embedded in an inode.
pub const ROOT_CAPACITY: usize = 4;

/// The exact on-disk size of the embedded tree root: one header plus four inline item slots.
pub const ROOT_SIZE: usize = HEADER_SIZE + ROOT_CAPACITY * ITEM_SIZE;

quick_error! {
    /// The ways resolving a logical block can fail. Every variant except `Disk` means the tree
    /// itself is corrupt or uses something this crate doesn't support; `Disk` means the injected
    /// device failed and is propagated verbatim, without retrying. A block simply not being
    /// mapped is not an error at all, but the `Ok(None)` outcome of [`ExtentResolver::resolve`].
    #[derive(Debug)]
    pub enum ExtentError {
        BadMagic(magic: u16) {
            description("extent tree header magic mismatch")
            display("extent tree header magic mismatch (got {:#06x})", magic)
        }
        TooManyEntries(count: u16, capacity: usize) {
            description("extent node entry count exceeds its capacity")
            display("extent node claims {} entries but has room for {}", count, capacity)
        }
        UnsupportedDepth(depth: u16) {
            description("unsupported extent tree depth")
            display("unsupported extent tree depth {}", depth)
        }
        BlockAddrTooLarge(high_bits: u16) {
            description("block address high bits set")
            display("block address has nonzero high bits ({:#06x}); only 32-bit volumes are supported", high_bits)
        }
        Parse(err: scroll::Error) {
            from()
            description("extent node parsing error")
            cause(err)
        }
        Disk(err: bmap::DeviceError) {
            from()
            description("device read error")
            cause(err)
            display("device read error: {}", err)
        }
    }
}

impl ExtentError {
    /// Whether the error means the extent tree is not navigable, as opposed to the device read
    /// failing. A caller validating many inodes can keep going past corruption, while a read
    /// failure usually means the whole device is in trouble.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Disk(_) => false,
            _ => true,
        }
    }
}

/// The header of an extent tree node, stored at the beginning of the inode blocks field, or of
/// the node's own tree block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Pread, Pwrite)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entry_count: u16,
    pub max_entry_count: u16,
    pub depth: u16,
    pub generation: u32,
}

impl ExtentHeader {
    pub fn is_leaf(&self) -> bool {
        self.depth == 0
    }
    fn validate_magic(&self) -> Result<(), ExtentError> {
        if self.magic != MAGIC {
            return Err(ExtentError::BadMagic(self.magic));
        }
        Ok(())
    }
}

/// An internal node item, pointing to the child node covering the logical blocks from `block`
/// onwards.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Pread, Pwrite)]
pub struct ExtentIndex {
    pub block: u32,
    pub leaf_lo: u32,
    pub leaf_hi: u16,
    pub unused: u16,
}

impl ExtentIndex {
    pub fn new(rel_baddr: u32, leaf: u64) -> Self {
        Self {
            block: rel_baddr,
            leaf_lo: leaf as u32,
            leaf_hi: (leaf >> 32) as u16,
            unused: 0,
        }
    }
    pub fn logical_block(&self) -> u32 {
        self.block
    }
    pub fn physical_child_block(&self) -> u64 {
        u64::from(self.leaf_lo) | u64::from(self.leaf_hi) << 32
    }
}

impl Ord for ExtentIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        Ord::cmp(&self.block, &other.block)
    }
}
impl PartialOrd for ExtentIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

/// A leaf, mapping a contiguous run of logical blocks within a file to a contiguous run of
/// physical blocks.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Pread, Pwrite)]
pub struct ExtentLeaf {
    pub block: u32,
    pub raw_len: u16,
    pub start_hi: u16,
    pub start_lo: u32,
}

const MAX_EXTENT_LEN: u16 = 32768;

impl ExtentLeaf {
    pub fn new(rel_baddr: u32, len: u16, phys_baddr: u64, initialized: bool) -> Self {
        assert!(len <= MAX_EXTENT_LEN);

        Self {
            block: rel_baddr,
            start_lo: phys_baddr as u32,
            start_hi: (phys_baddr >> 32) as u16,
            raw_len: if initialized { len } else { len + MAX_EXTENT_LEN },
        }
    }
    /// The length of the extent, in blocks. The top bit of the raw field is the "uninitialized"
    /// flag, which is masked off here rather than interpreted.
    pub fn len(&self) -> u16 {
        if self.raw_len > MAX_EXTENT_LEN {
            self.raw_len - MAX_EXTENT_LEN
        } else {
            self.raw_len
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_initialized(&self) -> bool {
        self.raw_len <= MAX_EXTENT_LEN
    }
    pub fn rel_range(&self) -> Range<u32> {
        self.block..self.block + u32::from(self.len())
    }
    /// The logical block of the extent within the file, which really is just `(offset / block_size)`.
    pub fn logical_block(&self) -> u32 {
        self.block
    }
    /// The block address of the first block that this extent points to.
    pub fn physical_start_block(&self) -> u64 {
        u64::from(self.start_lo) | u64::from(self.start_hi) << 32
    }
    /// Whether this extent's range contains `lblock`. Both bounds are checked, so an entry
    /// starting after `lblock` never covers it, no matter what the raw length arithmetic would
    /// say for an out-of-order or overlapping (i.e. malformed) entry sequence.
    pub fn covers(&self, lblock: u32) -> bool {
        self.block <= lblock && u64::from(lblock) < u64::from(self.block) + u64::from(self.len())
    }
}

impl Ord for ExtentLeaf {
    fn cmp(&self, other: &Self) -> Ordering {
        Ord::cmp(&self.block, &other.block)
    }
}
impl PartialOrd for ExtentLeaf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

/// The items of the tree root: child pointers when the tree has a level of indirection, leaves
/// when the root is itself the only node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExtentRootBody {
    Internal(ArrayVec<[ExtentIndex; ROOT_CAPACITY]>),
    Leaf(ArrayVec<[ExtentLeaf; ROOT_CAPACITY]>),
}

/// The extent tree root embedded in the 60-byte blocks field of an inode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtentRoot {
    pub header: ExtentHeader,
    pub body: ExtentRootBody,
}

impl ExtentRoot {
    /// Parse the tree root from the blocks field of an inode. The items are interpreted
    /// according to the depth stored in the header: depth 0 means the root holds the leaves
    /// directly, depth 1 means it points to leaf nodes elsewhere on the device. Deeper trees
    /// are rejected rather than misread.
    pub fn from_inode_blocks(bytes: &[u8]) -> Result<Self, ExtentError> {
        let header: ExtentHeader = bytes.pread_with(0, scroll::LE)?;
        header.validate_magic()?;

        if usize::from(header.entry_count) > ROOT_CAPACITY {
            return Err(ExtentError::TooManyEntries(header.entry_count, ROOT_CAPACITY));
        }

        let body = match header.depth {
            0 => ExtentRootBody::Leaf(
                (0..usize::from(header.entry_count))
                    .map(|i| bytes.pread_with(HEADER_SIZE + i * ITEM_SIZE, scroll::LE))
                    .collect::<Result<_, scroll::Error>>()?,
            ),
            1 => ExtentRootBody::Internal(
                (0..usize::from(header.entry_count))
                    .map(|i| bytes.pread_with(HEADER_SIZE + i * ITEM_SIZE, scroll::LE))
                    .collect::<Result<_, scroll::Error>>()?,
            ),
            depth => return Err(ExtentError::UnsupportedDepth(depth)),
        };

        Ok(Self { header, body })
    }
    /// Serialize the tree root back into an inode blocks field. Unused item slots are left as
    /// they are in the output buffer.
    pub fn to_inode_blocks(&self, bytes: &mut [u8]) -> Result<(), scroll::Error> {
        let mut offset = 0;
        bytes.gwrite_with(&self.header, &mut offset, scroll::LE)?;

        match self.body {
            ExtentRootBody::Internal(ref items) => {
                for item in items {
                    bytes.gwrite_with(item, &mut offset, scroll::LE)?;
                }
            }
            ExtentRootBody::Leaf(ref leaves) => {
                for leaf in leaves {
                    bytes.gwrite_with(leaf, &mut offset, scroll::LE)?;
                }
            }
        }
        Ok(())
    }

    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    /// Check that all the items in the root are sorted by logical block. This is a fundamental
    /// requirement for B+ trees, which resolution itself doesn't rely on.
    pub fn is_sorted(&self) -> bool {
        match self.body {
            ExtentRootBody::Internal(ref items) => {
                items.windows(2).all(|pair| pair[0] < pair[1])
            }
            ExtentRootBody::Leaf(ref items) => items.windows(2).all(|pair| pair[0] < pair[1]),
        }
    }
}

/// A resolved logical block: where it lives on the device, and how many blocks (this one
/// included) remain mapped contiguously after it. The run length lets callers batch sequential
/// reads without re-resolving every block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub physical_block: u64,
    pub run_length: u32,
}

/// Find the extent covering `lblock` in a leaf item sequence, in stored order. The first
/// covering item wins; later items are never consulted once one matches, even if they would
/// also (incorrectly) claim coverage. No match means the block is a hole, which is not an
/// error. Pure; performs no I/O.
pub fn find_in_leaves(leaves: &[ExtentLeaf], lblock: u32) -> Option<Mapping> {
    log::trace!("leaf node contains {} entries", leaves.len());
    log::trace!("looking for logical block {}", lblock);

    for (index, leaf) in leaves.iter().enumerate() {
        if !leaf.covers(lblock) {
            continue;
        }
        let offset_within = lblock - leaf.logical_block();
        log::trace!("logical block located at [{}:{}]", index, offset_within);

        let run_end = u64::from(leaf.logical_block()) + u64::from(leaf.len());
        return Some(Mapping {
            physical_block: leaf.physical_start_block() + u64::from(offset_within),
            run_length: (run_end - u64::from(lblock)) as u32,
        });
    }

    log::trace!("no extent covers logical block {}", lblock);
    None
}

/// Walks the extent tree of one inode, mapping logical block numbers within the file to
/// physical block numbers on the device.
///
/// The walker holds no mutable state and caches nothing, so one resolver may serve concurrent
/// `resolve` calls as long as the device's `read_blocking` tolerates them.
pub struct ExtentResolver<'a, D> {
    device: &'a D,
    block_size: u32,
}

impl<'a, D: bmap::DeviceRo> ExtentResolver<'a, D> {
    /// Create a resolver reading through `device`. The block size comes from the filesystem
    /// superblock, which this crate doesn't parse itself.
    pub fn new(device: &'a D, block_size: u32) -> Self {
        Self { device, block_size }
    }

    fn block_to_bytes(&self, block: u32) -> u64 {
        u64::from(block) * u64::from(self.block_size)
    }

    /// Fetch the node stored at `block` and decode its leaf items. A depth-1 root must point
    /// directly at leaves, so a child claiming any other depth is rejected. The returned buffer
    /// lives only for the walk step that requested it.
    fn read_leaves_in_block(&self, block: u32) -> Result<Vec<ExtentLeaf>, ExtentError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.device
            .read_blocking(self.block_to_bytes(block), &mut header_bytes)?;
        let header: ExtentHeader = header_bytes[..].pread_with(0, scroll::LE)?;

        header.validate_magic()?;
        if !header.is_leaf() {
            return Err(ExtentError::UnsupportedDepth(header.depth));
        }

        let capacity = (self.block_size as usize).saturating_sub(HEADER_SIZE) / ITEM_SIZE;
        if usize::from(header.entry_count) > capacity {
            return Err(ExtentError::TooManyEntries(header.entry_count, capacity));
        }
        if header.entry_count > header.max_entry_count {
            return Err(ExtentError::TooManyEntries(
                header.entry_count,
                usize::from(header.max_entry_count),
            ));
        }

        let mut item_bytes = vec![0u8; usize::from(header.entry_count) * ITEM_SIZE];
        self.device.read_blocking(
            self.block_to_bytes(block) + HEADER_SIZE as u64,
            &mut item_bytes,
        )?;

        (0..usize::from(header.entry_count))
            .map(|i| {
                item_bytes
                    .pread_with(i * ITEM_SIZE, scroll::LE)
                    .map_err(ExtentError::from)
            })
            .collect()
    }

    /// Resolve a logical block within the file whose tree root is `root`. `Ok(None)` means the
    /// tree is well formed but no extent covers the block (a hole, or a query past the mapped
    /// range); corruption and read failures are errors and abort the call without a partial
    /// result.
    pub fn resolve(&self, root: &ExtentRoot, lblock: u32) -> Result<Option<Mapping>, ExtentError> {
        root.header.validate_magic()?;
        if usize::from(root.header.entry_count) > ROOT_CAPACITY {
            return Err(ExtentError::TooManyEntries(
                root.header.entry_count,
                ROOT_CAPACITY,
            ));
        }

        match root.body {
            ExtentRootBody::Leaf(ref leaves) => {
                check_leaf_addresses(leaves)?;
                Ok(find_in_leaves(leaves, lblock))
            }
            ExtentRootBody::Internal(ref items) => {
                for item in items {
                    if item.leaf_hi != 0 {
                        return Err(ExtentError::BlockAddrTooLarge(item.leaf_hi));
                    }

                    let leaves = self.read_leaves_in_block(item.leaf_lo)?;
                    check_leaf_addresses(&leaves)?;

                    if let Some(mapping) = find_in_leaves(&leaves, lblock) {
                        return Ok(Some(mapping));
                    }
                    // Not in this child; the next item may still cover the block.
                }
                Ok(None)
            }
        }
    }
}

/// Every physical start address has to fit in 32 bits before the leaves may be searched.
fn check_leaf_addresses(leaves: &[ExtentLeaf]) -> Result<(), ExtentError> {
    match leaves.iter().find(|leaf| leaf.start_hi != 0) {
        Some(leaf) => Err(ExtentError::BlockAddrTooLarge(leaf.start_hi)),
        None => Ok(()),
    }
}
