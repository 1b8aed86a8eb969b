//! Text rendering of the dependency tree, for debugging build descriptions.
//!
//! ```text
//! +-app
//!   +-main.o
//!   | +-main.c
//!   | +-util.h
//!   +-util.o
//!     +-util.c
//!     +-util.h
//! ```

use std::collections::HashSet;
use std::fmt::Write;

use crate::engine::BuildReport;
use crate::graph::{Graph, NodeId, NodeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeMode {
    /// Every node, shared subtrees repeated in full.
    #[default]
    All,
    /// Only nodes something knows how to build; sources are left out.
    Derived,
    /// Subtrees already printed are shown once, later occurrences are
    /// abbreviated as `[key]`.
    Prune,
    /// Like [`TreeMode::All`], with a column of status flags per node.
    Status,
}

const LEGEND: &str = "\
 E         = exists
  U/N/B/F  = up to date / needs build / built / failed
   P       = precious
    A      = always build
     I     = ignore errors
      S    = side effect
";

/// Renders the trees rooted at `roots`. State flags in
/// [`TreeMode::Status`] come from `report` when one is given.
pub fn render(graph: &Graph, roots: &[NodeId], report: Option<&BuildReport>, mode: TreeMode) -> String {
    let mut renderer = Renderer {
        graph,
        report,
        mode,
        printed: HashSet::new(),
        ancestors: HashSet::new(),
        out: String::new(),
    };

    if mode == TreeMode::Status {
        renderer.out.push_str(LEGEND);
        renderer.out.push('\n');
    }

    for &root in roots {
        renderer.walk(root, "", true);
    }

    renderer.out
}

struct Renderer<'a> {
    graph: &'a Graph,
    report: Option<&'a BuildReport>,
    mode: TreeMode,
    printed: HashSet<NodeId>,
    ancestors: HashSet<NodeId>,
    out: String,
}

impl Renderer<'_> {
    fn walk(&mut self, id: NodeId, prefix: &str, last: bool) {
        let graph = self.graph;
        let node = graph.node(id);

        if self.mode == TreeMode::Status {
            let flags = self.flags(id);
            self.out.push_str(&flags);
        }

        let pruned = self.mode == TreeMode::Prune && self.printed.contains(&id);
        let _ = if pruned {
            writeln!(self.out, "{prefix}+-[{}]", node.key())
        } else {
            writeln!(self.out, "{prefix}+-{}", node.key())
        };

        // A cycle can't be built, but it can still be looked at.
        if pruned || !self.ancestors.insert(id) {
            return;
        }
        self.printed.insert(id);

        let children: Vec<NodeId> = graph
            .children(id)
            .into_iter()
            .filter(|&child| self.mode != TreeMode::Derived || !graph.node(child).is_source())
            .collect();

        let child_prefix = format!("{prefix}{}", if last { "  " } else { "| " });
        for (i, &child) in children.iter().enumerate() {
            self.walk(child, &child_prefix, i + 1 == children.len());
        }

        self.ancestors.remove(&id);
    }

    fn flags(&self, id: NodeId) -> String {
        let node = self.graph.node(id);
        let attributes = node.attributes;
        let exists = node.path().is_some_and(|path| path.exists());
        let state = match self.report.and_then(|report| report.state(id)) {
            Some(NodeState::UpToDate) => 'U',
            Some(NodeState::NeedsBuild) => 'N',
            Some(NodeState::Built) => 'B',
            Some(NodeState::Failed) => 'F',
            _ => ' ',
        };

        let flag = |on: bool, c: char| if on { c } else { ' ' };
        format!(
            "[{}{}{}{}{}{}] ",
            flag(exists, 'E'),
            state,
            flag(attributes.precious, 'P'),
            flag(attributes.always_build, 'A'),
            flag(attributes.ignore_errors, 'I'),
            flag(attributes.side_effect, 'S'),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::FnAction;

    fn graph() -> (Graph, NodeId) {
        let mut graph = Graph::new();
        let app = graph.add_node("app");
        let main_o = graph.add_node("main.o");
        let util_o = graph.add_node("util.o");
        let main_c = graph.add_node("main.c");
        let util_c = graph.add_node("util.c");
        let util_h = graph.add_node("util.h");

        graph.add_dependency(app, main_o);
        graph.add_dependency(app, util_o);
        graph.add_dependency(main_o, main_c);
        graph.add_dependency(main_o, util_h);
        graph.add_dependency(util_o, util_c);
        graph.add_dependency(util_o, util_h);

        for id in [app, main_o, util_o] {
            graph.set_action(id, FnAction::new("cc", |_| Ok(())));
        }
        (graph, app)
    }

    #[test]
    fn test_render_all() {
        let (graph, app) = graph();
        let expected = "\
+-app
  +-main.o
  | +-main.c
  | +-util.h
  +-util.o
    +-util.c
    +-util.h
";
        assert_eq!(render(&graph, &[app], None, TreeMode::All), expected);
    }

    #[test]
    fn test_render_derived_and_prune() {
        let (graph, app) = graph();
        assert_eq!(
            render(&graph, &[app], None, TreeMode::Derived),
            "+-app\n  +-main.o\n  +-util.o\n"
        );

        let pruned = render(&graph, &[app], None, TreeMode::Prune);
        assert!(pruned.ends_with("    +-util.c\n    +-[util.h]\n"));
    }

    #[test]
    fn test_render_status_flags() {
        let (mut graph, app) = graph();
        graph.attributes_mut(app).precious = true;
        let rendered = render(&graph, &[app], None, TreeMode::Status);
        assert!(rendered.starts_with(LEGEND));
        assert!(rendered.contains("[  P   ] +-app\n"));
    }
}
