//! The unique-callstack table: collapses repeated chains to a u32 id.
//!
//! Chains are stored as a prefix-shared linked list of nodes; a node is
//! `(ip, parent index)` and a stack id is the index of the node for the
//! innermost frame. Interning is idempotent and the whole table
//! serializes into a feature section at the file tail.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

/// Parent index of chain roots.
pub const STACK_NODE_ROOT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StackNode {
    ip: u64,
    parent: u32,
}

#[derive(Debug, Default)]
pub struct UniStackTable {
    nodes: Vec<StackNode>,
    index: FxHashMap<StackNode, u32>,
}

impl UniStackTable {
    pub fn new() -> UniStackTable {
        UniStackTable::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn intern_node(&mut self, node: StackNode) -> u32 {
        if let Some(&id) = self.index.get(&node) {
            return id;
        }
        let id = self.nodes.len() as u32;
        self.nodes.push(node);
        self.index.insert(node, id);
        id
    }

    /// Intern a chain (innermost first) and return its stack id.
    /// Interning the same chain again returns the same id.
    pub fn intern(&mut self, ips: &[u64]) -> u32 {
        let mut parent = STACK_NODE_ROOT;
        // Walk caller -> callee so shared outer frames share nodes.
        for &ip in ips.iter().rev() {
            parent = self.intern_node(StackNode { ip, parent });
        }
        parent
    }

    /// Rebuild the chain (innermost first) for a stack id.
    pub fn expand(&self, stack_id: u32) -> Option<Vec<u64>> {
        if stack_id == STACK_NODE_ROOT {
            return Some(Vec::new());
        }
        let mut ips = Vec::new();
        let mut current = stack_id;
        while current != STACK_NODE_ROOT {
            let node = self.nodes.get(current as usize)?;
            ips.push(node.ip);
            current = node.parent;
        }
        Some(ips)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.nodes.len() as u32)
            .unwrap();
        for node in &self.nodes {
            out.write_u64::<LittleEndian>(node.ip).unwrap();
            out.write_u32::<LittleEndian>(node.parent).unwrap();
        }
    }

    pub fn read(mut data: &[u8]) -> std::io::Result<UniStackTable> {
        let count = data.read_u32::<LittleEndian>()? as usize;
        let mut table = UniStackTable::default();
        for _ in 0..count {
            let ip = data.read_u64::<LittleEndian>()?;
            let parent = data.read_u32::<LittleEndian>()?;
            let node = StackNode { ip, parent };
            let id = table.nodes.len() as u32;
            table.nodes.push(node);
            table.index.insert(node, id);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut table = UniStackTable::new();
        let chain = [0x100, 0x200, 0x300];
        let first = table.intern(&chain);
        let second = table.intern(&chain);
        assert_eq!(first, second);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn shared_callers_share_nodes() {
        let mut table = UniStackTable::new();
        let id_a = table.intern(&[0x10, 0x20, 0x30]);
        let id_b = table.intern(&[0x11, 0x20, 0x30]);
        assert_ne!(id_a, id_b);
        // Only the innermost frame differs.
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn expand_returns_the_original_chain() {
        let mut table = UniStackTable::new();
        let chain = vec![0xAAA, 0xBBB, 0xCCC, 0xDDD];
        let id = table.intern(&chain);
        assert_eq!(table.expand(id).unwrap(), chain);
    }

    #[test]
    fn serialization_round_trip() {
        let mut table = UniStackTable::new();
        let id_a = table.intern(&[1, 2, 3]);
        let id_b = table.intern(&[9, 2, 3]);

        let mut buf = Vec::new();
        table.write(&mut buf);
        let back = UniStackTable::read(&buf).unwrap();
        assert_eq!(back.len(), table.len());
        assert_eq!(back.expand(id_a).unwrap(), vec![1, 2, 3]);
        assert_eq!(back.expand(id_b).unwrap(), vec![9, 2, 3]);

        // The reloaded table keeps interning consistently.
        let mut back = back;
        assert_eq!(back.intern(&[1, 2, 3]), id_a);
    }

    #[test]
    fn bad_ids_expand_to_none() {
        let table = UniStackTable::new();
        assert!(table.expand(5).is_none());
    }
}
