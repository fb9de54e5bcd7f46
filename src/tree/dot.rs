//! Graphviz dump of the whole tree (spec.md §4.4 `dot_graph`), used for
//! debugging tree shape and leaf-chain wiring during development.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;

use log::warn;

use crate::block::block_id_valid;
use crate::codec::Codec;
use crate::error::Result;

use super::BTree;

impl<K: Codec, V: Codec> BTree<K, V> {
    /// Writes a Graphviz `.dot` description of the tree to `path`. If
    /// `display` is set, best-effort invokes the `dot` binary to render a
    /// PNG alongside it; failure to do so (e.g. `dot` not installed) is
    /// logged and otherwise ignored.
    pub fn dot_graph(&mut self, path: impl AsRef<Path>, display: bool) -> Result<()> {
        let path = path.as_ref();
        let mut out = String::new();
        out.push_str("digraph BTree {\n  node [shape=record];\n");

        if block_id_valid(self.root_id) {
            let mut stack = vec![self.root_id];
            let mut seen = std::collections::HashSet::new();
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                let node = self.load_node(id)?;
                let node = node.borrow();

                let mut label = format!("id={}", id);
                if node.leaf {
                    let _ = write!(label, "|rank={}|leaf", node.rank());
                } else {
                    let _ = write!(label, "|rank={}|inner", node.rank());
                }
                let _ = writeln!(out, "  n{} [label=\"{}\"];", id, label);

                if node.leaf {
                    if block_id_valid(node.right_id) {
                        let _ = writeln!(out, "  n{} -> n{} [style=dashed,constraint=false];", id, node.right_id);
                    }
                } else {
                    for &child in &node.children {
                        let _ = writeln!(out, "  n{} -> n{};", id, child);
                        stack.push(child);
                    }
                }
            }
        }

        out.push_str("}\n");
        fs::write(path, out)?;

        if display {
            let png = path.with_extension("png");
            let status = Command::new("dot")
                .args(["-Tpng", "-o"])
                .arg(&png)
                .arg(path)
                .status();
            match status {
                Ok(s) if s.success() => {}
                Ok(_) | Err(_) => warn!("dot_graph: could not render {:?} (is graphviz installed?)", png),
            }
        }

        Ok(())
    }
}
