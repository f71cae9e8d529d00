// Directory objects: $I30 lookup and ordered enumeration
// A DirShared is built once per directory record and shared by every open
// handle; a DirCursor walks the B+tree with an explicit stack.

use super::index::{IndexEntry, IndexNode, IndexNodeInfo, IndexRootInfo, NodeLoader};
use super::info::ObjectInfo;
use super::record::{Attribute, Core};
use super::structures::*;
use super::upcase::UpcaseTable;
use log::trace;
use ntvfs_core::NtvfsError;
use std::cmp::Ordering;
use std::sync::Arc;

/// Longest name NTFS can store, in UTF-16 units.
pub const MAX_NAME_UNITS: usize = 255;

/// Upper bound on the enumeration stack, and on lookup descent.
const MAX_INDEX_DEPTH: usize = 1024;

/// Shared state of one directory: its core and the validated index root.
#[derive(Debug)]
pub struct DirShared {
    pub core: Arc<Core>,
    pub root: IndexRootInfo,
}

/// What a successful lookup found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirLookup {
    pub file_ref: MftRef,
    pub is_directory: bool,
    /// File attributes from the index key
    pub attributes: u32,
}

/// One enumerated directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub file_ref: MftRef,
    pub info: ObjectInfo,
}

impl DirShared {
    pub fn new(core: Arc<Core>, cluster_size: u32, cluster_shift: u8) -> Result<Self, NtvfsError> {
        if !core.is_directory() {
            return Err(NtvfsError::NotADirectory(format!(
                "MFT record {:#x} is not flagged as a directory",
                core.mft_index
            )));
        }
        if core.find_named(ATTR_TYPE_INDEX_ROOT, DIR_INDEX_NAME).is_none() {
            return Err(NtvfsError::NotADirectory(format!(
                "MFT record {:#x} has no $I30 INDEX_ROOT",
                core.mft_index
            )));
        }
        let what = format!("Dir {:#x}", core.mft_index);
        let root = IndexRootInfo::load(&core, cluster_size, cluster_shift, &what)?;
        Ok(DirShared { core, root })
    }

    pub fn mft_index(&self) -> u64 {
        self.core.mft_index
    }

    pub fn root_attr(&self) -> &Attribute {
        &self.core.attributes[self.root.root_attr]
    }

    pub fn alloc_attr(&self) -> Option<&Attribute> {
        self.root.alloc_attr.map(|i| &self.core.attributes[i])
    }

    /// Resident INDEX_ROOT value the root node offsets refer to.
    pub fn root_value(&self) -> &[u8] {
        // The index root was validated as resident when this object was built
        self.core.resident_value(self.root_attr()).unwrap_or(&[])
    }

    fn query_node(&self, loader: &mut NodeLoader<'_>, address: i64) -> Result<Arc<IndexNode>, NtvfsError> {
        let alloc = self.alloc_attr().ok_or_else(|| {
            NtvfsError::BogusFormat(format!(
                "Dir {:#x}: subnode {:#x} referenced without INDEX_ALLOCATION",
                self.mft_index(),
                address
            ))
        })?;
        loader.query_node(&self.core, alloc, &self.root.addressing, address)
    }

    /// Look `name` up in the directory index, case-insensitively.
    pub fn lookup(
        &self,
        upcase: &UpcaseTable,
        name: &str,
        loader: &mut NodeLoader<'_>,
    ) -> Result<DirLookup, NtvfsError> {
        let target = upcase.upcase_str(name);
        if target.len() > MAX_NAME_UNITS {
            return Err(NtvfsError::FilenameTooLong(format!(
                "{} UTF-16 units, max {}",
                target.len(),
                MAX_NAME_UNITS
            )));
        }

        enum Step {
            Found(DirLookup),
            Descend(i64),
        }

        let mut node: Option<Arc<IndexNode>> = None;
        for _ in 0..MAX_INDEX_DEPTH {
            let step = {
                let (buf, info): (&[u8], &IndexNodeInfo) = match &node {
                    Some(n) => (&n.data, &n.info),
                    None => (self.root_value(), &self.root.root),
                };
                let count = info.len().saturating_sub(1);
                let mut pos = count;
                let mut found = None;
                for i in 0..count {
                    let entry = info.entry(buf, i);
                    match upcase.compare(&target, &entry.name_units()) {
                        Ordering::Greater => continue,
                        Ordering::Equal => {
                            found = Some(classify(&entry)?);
                            break;
                        }
                        Ordering::Less => {
                            pos = i;
                            break;
                        }
                    }
                }
                match found {
                    Some(hit) => Step::Found(hit),
                    None => {
                        let entry = info.entry(buf, pos);
                        if !entry.is_internal() {
                            return Err(NtvfsError::NotFound(name.to_string()));
                        }
                        Step::Descend(entry.subnode())
                    }
                }
            };
            match step {
                Step::Found(hit) => return Ok(hit),
                Step::Descend(address) => node = Some(self.query_node(loader, address)?),
            }
        }
        Err(NtvfsError::BogusFormat(format!(
            "Dir {:#x}: index deeper than {} levels",
            self.mft_index(),
            MAX_INDEX_DEPTH
        )))
    }
}

fn classify(entry: &IndexEntry<'_>) -> Result<DirLookup, NtvfsError> {
    let attributes = entry.file_name()?.file_attributes;
    let file_ref = entry.file_ref();
    let kind = attributes & (FILE_ATTR_DOS_DIRECTORY | FILE_ATTR_DIRECTORY | FILE_ATTR_REPARSE_POINT);
    if kind & FILE_ATTR_REPARSE_POINT != 0 {
        return Err(NtvfsError::NotSupported(format!(
            "reparse point {} (attributes {:#x})",
            file_ref, attributes
        )));
    }
    Ok(DirLookup {
        file_ref,
        is_directory: kind != 0,
        attributes,
    })
}

#[derive(Debug)]
enum FrameNode {
    Root,
    Node(Arc<IndexNode>),
}

#[derive(Debug)]
struct Frame {
    node: FrameNode,
    /// Next entry to report
    next: usize,
    /// Whether the subtree of entry `next` still has to be walked first
    descend: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Dot,
    DotDot,
    Tree,
    Done,
}

/// Position of an in-progress directory enumeration.
///
/// `.` and `..` are reported first, then the index entries in collation
/// order. The cursor can only be restarted from the beginning.
#[derive(Debug)]
pub struct DirCursor {
    dir: Arc<DirShared>,
    state: CursorState,
    stack: Vec<Frame>,
    max_depth: usize,
}

enum WalkStep {
    Yield(DirEntry),
    Descend(i64),
    Pop,
}

impl DirCursor {
    pub fn new(dir: Arc<DirShared>) -> Self {
        let max_depth = initial_depth(&dir);
        DirCursor {
            dir,
            state: CursorState::Dot,
            stack: Vec::with_capacity(max_depth),
            max_depth,
        }
    }

    pub fn dir(&self) -> &Arc<DirShared> {
        &self.dir
    }

    pub fn rewind(&mut self) {
        self.state = CursorState::Dot;
        self.stack.clear();
    }

    pub fn is_done(&self) -> bool {
        self.state == CursorState::Done
    }

    pub(crate) fn at_dot(&self) -> bool {
        self.state == CursorState::Dot
    }

    pub(crate) fn at_dot_dot(&self) -> bool {
        self.state == CursorState::DotDot
    }

    /// Step past `.` or `..` once it has been reported.
    pub(crate) fn skip_dot(&mut self) {
        self.state = match self.state {
            CursorState::Dot => CursorState::DotDot,
            CursorState::DotDot => CursorState::Tree,
            other => other,
        };
    }

    fn push(&mut self, node: FrameNode) -> Result<(), NtvfsError> {
        if self.stack.len() + 1 >= self.max_depth {
            if self.max_depth >= MAX_INDEX_DEPTH {
                return Err(NtvfsError::BogusFormat(format!(
                    "Dir {:#x}: badly unbalanced index, stack depth {}",
                    self.dir.mft_index(),
                    self.stack.len()
                )));
            }
            self.max_depth = (self.max_depth * 2).min(MAX_INDEX_DEPTH);
            self.stack.reserve(self.max_depth - self.stack.len());
        }
        self.stack.push(Frame {
            node,
            next: 0,
            descend: false,
        });
        Ok(())
    }

    /// Push `address` and the chain of leftmost children below it.
    fn descend(&mut self, loader: &mut NodeLoader<'_>, mut address: i64) -> Result<(), NtvfsError> {
        loop {
            let node = self.dir.query_node(loader, address)?;
            trace!(
                "Dir {:#x}: descending into node {:#x} (depth {})",
                self.dir.mft_index(),
                address,
                self.stack.len()
            );
            let next = if node.info.internal && !node.info.is_empty() {
                let first = node.entry(0);
                first.is_internal().then(|| first.subnode())
            } else {
                None
            };
            self.push(FrameNode::Node(node))?;
            match next {
                Some(child) => address = child,
                None => return Ok(()),
            }
        }
    }

    fn start_tree(&mut self, loader: &mut NodeLoader<'_>) -> Result<(), NtvfsError> {
        self.push(FrameNode::Root)?;
        let root = &self.dir.root.root;
        if root.internal && !root.is_empty() {
            let first = root.entry(self.dir.root_value(), 0);
            if first.is_internal() {
                let address = first.subnode();
                self.descend(loader, address)?;
            }
        }
        Ok(())
    }

    /// Next index entry in collation order, or None once the tree is exhausted.
    pub(crate) fn next_tree_entry(
        &mut self,
        loader: &mut NodeLoader<'_>,
    ) -> Result<Option<DirEntry>, NtvfsError> {
        match self.state {
            CursorState::Done => return Ok(None),
            CursorState::Tree => {}
            CursorState::Dot | CursorState::DotDot => {
                self.state = CursorState::Tree;
            }
        }
        if self.stack.is_empty() {
            self.start_tree(loader)?;
        }

        loop {
            let step = {
                let Some(frame) = self.stack.last() else {
                    self.state = CursorState::Done;
                    return Ok(None);
                };
                let (buf, info): (&[u8], &IndexNodeInfo) = match &frame.node {
                    FrameNode::Root => (self.dir.root_value(), &self.dir.root.root),
                    FrameNode::Node(n) => (&n.data, &n.info),
                };
                if frame.next < info.len() {
                    let entry = info.entry(buf, frame.next);
                    if !entry.is_internal() || !frame.descend {
                        if entry.is_end() {
                            WalkStep::Pop
                        } else {
                            WalkStep::Yield(DirEntry {
                                name: String::from_utf16_lossy(&entry.name_units()),
                                file_ref: entry.file_ref(),
                                info: ObjectInfo::from_index_entry(&entry)?,
                            })
                        }
                    } else {
                        WalkStep::Descend(entry.subnode())
                    }
                } else {
                    WalkStep::Pop
                }
            };

            match step {
                WalkStep::Yield(entry) => {
                    if let Some(frame) = self.stack.last_mut() {
                        frame.next += 1;
                        frame.descend = true;
                    }
                    return Ok(Some(entry));
                }
                WalkStep::Descend(address) => {
                    if let Some(frame) = self.stack.last_mut() {
                        frame.descend = false;
                    }
                    self.descend(loader, address)?;
                }
                WalkStep::Pop => {
                    self.stack.pop();
                }
            }
        }
    }
}

/// Starting stack depth: enough for a balanced tree over the allocation.
fn initial_depth(dir: &DirShared) -> usize {
    let node_size = dir.root.addressing.node_size as u64;
    let nodes = if node_size == 0 { 0 } else { dir.root.allocation_size / node_size };
    if nodes == 0 {
        2
    } else {
        nodes.trailing_zeros() as usize + 3
    }
}
