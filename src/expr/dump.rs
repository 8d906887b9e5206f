// Debug renderings of expression trees: an indented listing in which every node is printed
// once (later references show only the node index) and a graphviz digraph. Both are used by
// the compiler when tree dumps are enabled and by the exprjit-dump tool.

use std::fmt::Write;

use super::{ExprTree, NodeId};

fn label(tree: &ExprTree, id: NodeId) -> String {
    let node = tree.node(id);
    let mut text = format!("{} {}", id, node.op);
    for arg in &node.args {
        let _ = write!(text, " {}", arg);
    }
    if node.size > 0 {
        let _ = write!(text, " :{}", node.size);
    }
    text
}

impl ExprTree {
    /// Indented listing of the subtrees of `roots`.
    pub fn dump(&self, roots: &[NodeId]) -> String {
        let mut out = String::new();
        let mut seen = vec![false; self.len()];
        for &root in roots {
            dump_node(self, root, 0, &mut seen, &mut out);
        }
        out
    }

    /// Graphviz rendering of the subtrees of `roots`.
    pub fn to_dot(&self, roots: &[NodeId], name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", name.replace('"', "'"));
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            let _ = writeln!(out, "  n{} [label=\"{}\"];", id.0, label(self, id));
            for (slot, &child) in self.children(id).iter().enumerate() {
                let _ = writeln!(out, "  n{} -> n{} [label=\"{}\"];", id.0, child.0, slot);
                stack.push(child);
            }
        }
        out.push_str("}\n");
        out
    }
}

fn dump_node(tree: &ExprTree, id: NodeId, depth: usize, seen: &mut [bool], out: &mut String) {
    let indent = "  ".repeat(depth);
    if std::mem::replace(&mut seen[id.index()], true) {
        let _ = writeln!(out, "{}^{}", indent, id);
        return;
    }
    let _ = writeln!(out, "{}{}", indent, label(tree, id));
    for &child in tree.children(id) {
        dump_node(tree, child, depth + 1, seen, out);
    }
}

#[cfg(test)]
mod tests {
    use crate::expr::parse_expr;

    #[test]
    fn test_dump_marks_shared_nodes() {
        let (tree, roots) = parse_expr("(add $x:(load (local) 8) $x)").unwrap();
        let text = tree.dump(&roots);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("0002 add"));
        assert!(lines[1].contains("load 8 :8"));
        assert_eq!(lines[3].trim(), "^0001");
    }

    #[test]
    fn test_dot_output() {
        let (tree, roots) = parse_expr("(not (tc))").unwrap();
        let dot = tree.to_dot(&roots, "t");
        assert!(dot.starts_with("digraph \"t\" {"));
        assert!(dot.contains("n1 -> n0"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
