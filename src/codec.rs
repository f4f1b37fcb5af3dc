//! Fixed-endian encoding of nodes, tree metadata, and the integers inside
//! them. Everything on disk is big-endian. Encoders never fail; decoders
//! return `Corrupt` on short buffers, unknown tags, or impossible counts.

use crate::error::{BrambleError, Result};
use crate::tree::node::{Node, Pointer, TreeMetadata};

const POINTER_TAG_CHILD: u8 = 0;
const POINTER_TAG_VALUE: u8 = 1;

const TREE_METADATA_SIZE: usize = 10;

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let end = offset
        .checked_add(2)
        .ok_or_else(|| BrambleError::Corrupt("u16 offset overflow".into()))?;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| BrambleError::Corrupt("buffer too short for u16".into()))?;
    Ok(u16::from_be_bytes(slice.try_into().expect("slice is 2 bytes")))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let end = offset
        .checked_add(4)
        .ok_or_else(|| BrambleError::Corrupt("u32 offset overflow".into()))?;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| BrambleError::Corrupt("buffer too short for u32".into()))?;
    Ok(u32::from_be_bytes(slice.try_into().expect("slice is 4 bytes")))
}

/// Encodes a node as
/// `id | parentID | leaf | keyNum | keySlots | keys | pointerNum |
/// pointerSlots | pointers`, where each key is length-prefixed (u16) and
/// each pointer is a tag byte followed by a child id or a length-prefixed
/// value. Slot counts preserve the node's allocated capacity so decoding
/// reproduces the same layout.
pub fn encode_node(node: &Node) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + node.keys.iter().map(|k| k.len() + 2).sum::<usize>());
    buf.extend_from_slice(&node.id.to_be_bytes());
    buf.extend_from_slice(&node.parent_id.to_be_bytes());
    buf.push(node.leaf as u8);
    buf.extend_from_slice(&(node.keys.len() as u16).to_be_bytes());
    buf.extend_from_slice(&node.key_slots.to_be_bytes());
    for key in &node.keys {
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.extend_from_slice(key);
    }
    buf.extend_from_slice(&(node.pointers.len() as u16).to_be_bytes());
    buf.extend_from_slice(&node.pointer_slots.to_be_bytes());
    for pointer in &node.pointers {
        match pointer {
            Pointer::Child(id) => {
                buf.push(POINTER_TAG_CHILD);
                buf.extend_from_slice(&id.to_be_bytes());
            }
            Pointer::Value(value) => {
                buf.push(POINTER_TAG_VALUE);
                buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
                buf.extend_from_slice(value);
            }
        }
    }
    buf
}

pub fn decode_node(data: &[u8]) -> Result<Node> {
    let id = read_u32(data, 0)?;
    let parent_id = read_u32(data, 4)?;
    let leaf = match data.get(8) {
        Some(0) => false,
        Some(1) => true,
        Some(other) => {
            return Err(BrambleError::Corrupt(format!(
                "invalid leaf flag 0x{other:02X}"
            )))
        }
        None => return Err(BrambleError::Corrupt("buffer too short for leaf flag".into())),
    };
    let mut offset = 9;
    let key_num = read_u16(data, offset)? as usize;
    let key_slots = read_u16(data, offset + 2)?;
    offset += 4;
    if key_num > key_slots as usize {
        return Err(BrambleError::Corrupt(format!(
            "key count {key_num} exceeds {key_slots} slots"
        )));
    }
    let mut keys = Vec::with_capacity(key_num);
    for _ in 0..key_num {
        let len = read_u16(data, offset)? as usize;
        offset += 2;
        let key = data
            .get(offset..offset + len)
            .ok_or_else(|| BrambleError::Corrupt("buffer too short for key".into()))?;
        keys.push(key.to_vec());
        offset += len;
    }
    let pointer_num = read_u16(data, offset)? as usize;
    let pointer_slots = read_u16(data, offset + 2)?;
    offset += 4;
    if pointer_num > pointer_slots as usize {
        return Err(BrambleError::Corrupt(format!(
            "pointer count {pointer_num} exceeds {pointer_slots} slots"
        )));
    }
    let mut pointers = Vec::with_capacity(pointer_num);
    for _ in 0..pointer_num {
        let tag = *data
            .get(offset)
            .ok_or_else(|| BrambleError::Corrupt("buffer too short for pointer tag".into()))?;
        offset += 1;
        match tag {
            POINTER_TAG_CHILD => {
                pointers.push(Pointer::Child(read_u32(data, offset)?));
                offset += 4;
            }
            POINTER_TAG_VALUE => {
                let len = read_u16(data, offset)? as usize;
                offset += 2;
                let value = data
                    .get(offset..offset + len)
                    .ok_or_else(|| BrambleError::Corrupt("buffer too short for value".into()))?;
                pointers.push(Pointer::Value(value.to_vec()));
                offset += len;
            }
            other => {
                return Err(BrambleError::Corrupt(format!(
                    "unknown pointer tag 0x{other:02X}"
                )))
            }
        }
    }
    Ok(Node {
        id,
        parent_id,
        leaf,
        keys,
        pointers,
        key_slots,
        pointer_slots,
    })
}

/// Tree metadata encodes as 10 bytes: order (u16), root id (u32),
/// leftmost leaf id (u32).
pub fn encode_tree_metadata(metadata: &TreeMetadata) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TREE_METADATA_SIZE);
    buf.extend_from_slice(&metadata.order.to_be_bytes());
    buf.extend_from_slice(&metadata.root_id.to_be_bytes());
    buf.extend_from_slice(&metadata.leftmost_id.to_be_bytes());
    buf
}

pub fn decode_tree_metadata(data: &[u8]) -> Result<TreeMetadata> {
    if data.len() < TREE_METADATA_SIZE {
        return Err(BrambleError::Corrupt(format!(
            "tree metadata is {} bytes, expected {TREE_METADATA_SIZE}",
            data.len()
        )));
    }
    Ok(TreeMetadata {
        order: read_u16(data, 0)?,
        root_id: read_u32(data, 2)?,
        leftmost_id: read_u32(data, 6)?,
    })
}
