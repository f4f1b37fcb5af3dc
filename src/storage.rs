//! Glue between the record layer and the node codec: nodes are records
//! addressed by id, tree metadata lives in the pager's custom-metadata slot.

use std::path::Path;

use crate::codec::{decode_node, decode_tree_metadata, encode_node, encode_tree_metadata};
use crate::error::Result;
use crate::pager::Pager;
use crate::records::Records;
use crate::tree::node::{Node, NodeId, TreeMetadata};

pub struct Storage {
    records: Records,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>, page_size: u16) -> Result<Self> {
        let pager = Pager::open(path, page_size)?;
        Ok(Self {
            records: Records::new(pager),
        })
    }

    pub fn new_node(&mut self) -> Result<NodeId> {
        self.records.create()
    }

    pub fn load_node(&self, id: NodeId) -> Result<Node> {
        let data = self.records.read(id)?;
        decode_node(&data)
    }

    pub fn update_node(&mut self, node: &Node) -> Result<()> {
        self.records.write(node.id, &encode_node(node))
    }

    pub fn delete_node(&mut self, id: NodeId) -> Result<()> {
        self.records.free(id)
    }

    pub fn load_metadata(&self) -> Result<Option<TreeMetadata>> {
        match self.records.pager().read_custom_metadata() {
            Some(data) => Ok(Some(decode_tree_metadata(data)?)),
            None => Ok(None),
        }
    }

    pub fn update_metadata(&mut self, metadata: &TreeMetadata) -> Result<()> {
        self.records
            .pager_mut()
            .write_custom_metadata(&encode_tree_metadata(metadata))
    }

    /// A zero-length custom payload signals an empty tree.
    pub fn delete_metadata(&mut self) -> Result<()> {
        self.records.pager_mut().write_custom_metadata(&[])
    }

    pub fn flush(&mut self) -> Result<()> {
        self.records.flush()
    }

    pub fn close(self) -> Result<()> {
        self.records.close()
    }
}
