//! Grouping of registers into contiguous read blocks.

use crate::catalog::{Catalog, FunctionKind, RegisterDef};
use std::time::Duration;

/// A register covered by a [`Block`].
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMember {
    /// Position of the definition in the catalog.
    pub index: usize,
    pub key: String,
    pub address: u16,
    pub length: u8,
    /// Word offset of the register within the block response.
    pub offset: usize,
}

/// Contiguous register span fetched with one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: FunctionKind,
    pub start: u16,
    /// Number of words.
    pub length: u16,
    /// Shortest interval of all members; the block is refreshed at this rate.
    pub interval: Duration,
    /// Members in ascending address order.
    pub members: Vec<BlockMember>,
}

impl Block {
    /// The word span of `member` inside a block response.
    pub fn words<'a>(&self, member: &BlockMember, response: &'a [u16]) -> Option<&'a [u16]> {
        response.get(member.offset..member.offset + usize::from(member.length))
    }
}

/// Partitions all registers with an address into contiguous blocks.
///
/// Registers are walked in `(kind, address)` order. A new block starts when
/// the kind changes, when the next register does not start right after the
/// previous one, or when it would stretch the block beyond `max_span` words.
/// A catalog without addressed registers yields no blocks.
pub fn plan(catalog: &Catalog, max_span: u16) -> Vec<Block> {
    let mut primitives: Vec<_> = catalog
        .iter()
        .enumerate()
        .filter_map(|(index, def)| match def {
            RegisterDef::Primitive(def) => Some((index, def)),
            RegisterDef::Composite(_) => None,
        })
        .collect();
    primitives.sort_by_key(|(_, def)| (def.kind, def.address));

    let max_span = u32::from(max_span);
    let mut blocks: Vec<Block> = Vec::new();
    for (index, def) in primitives {
        let interval = catalog.interval_of(def);
        let extends_last = blocks.last().is_some_and(|block| {
            let block_end = u32::from(block.start) + u32::from(block.length);
            block.kind == def.kind
                && u32::from(def.address) == block_end
                && def.end() - u32::from(block.start) <= max_span
        });
        if !extends_last {
            blocks.push(Block {
                kind: def.kind,
                start: def.address,
                length: 0,
                interval,
                members: Vec::new(),
            });
        }
        let Some(block) = blocks.last_mut() else {
            continue;
        };
        block.members.push(BlockMember {
            index,
            key: def.key.clone(),
            address: def.address,
            length: def.length,
            offset: usize::from(def.address - block.start),
        });
        block.length += u16::from(def.length);
        block.interval = block.interval.min(interval);
    }
    blocks
}
