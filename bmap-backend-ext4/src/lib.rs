//! Resolution of logical block addresses within ext4 inodes that use extent trees.
//!
//! Extent-mapped inodes store a small tree in their 60-byte blocks field instead of the classic
//! indirect block pointer chains. This crate decodes that tree and answers the single question
//! the rest of the stack needs answered: which physical block on the device holds logical block
//! N of this file, if any.

pub mod extents;

pub use extents::{
    find_in_leaves, ExtentError, ExtentHeader, ExtentIndex, ExtentLeaf, ExtentResolver,
    ExtentRoot, Mapping,
};
