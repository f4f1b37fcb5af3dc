use crate::error::Result;
use crate::storage::Storage;
use crate::tree::node::Node;

/// Walks the leaf chain from the leftmost leaf, yielding entries in
/// ascending byte-wise key order. The borrow of the tree keeps mutation out
/// for the iterator's lifetime.
pub struct Iter<'a> {
    storage: &'a Storage,
    node: Option<Node>,
    position: usize,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(storage: &'a Storage, node: Option<Node>) -> Self {
        Self {
            storage,
            node,
            position: 0,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;
            if self.position < node.key_num() {
                let key = node.keys[self.position].clone();
                let value = match node.value_at(self.position) {
                    Ok(value) => value.to_vec(),
                    Err(err) => {
                        self.node = None;
                        return Some(Err(err));
                    }
                };
                self.position += 1;
                return Some(Ok((key, value)));
            }

            let next_id = match node.next_leaf() {
                Ok(id) => id,
                Err(err) => {
                    self.node = None;
                    return Some(Err(err));
                }
            };
            if next_id == 0 {
                self.node = None;
                return None;
            }
            match self.storage.load_node(next_id) {
                Ok(next) => {
                    self.node = Some(next);
                    self.position = 0;
                }
                Err(err) => {
                    self.node = None;
                    return Some(Err(err));
                }
            }
        }
    }
}
