use std::fmt::Write;

use crate::pass_graph::{PassId, PassSystem};

/// Logs a pass's template slots and connections plus its resolved bindings.
pub fn show_connections(sys: &dyn PassSystem, id: PassId) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let Some(pass) = sys.pass(id) else { return };
    log::debug!("[dist] {} ({})", pass.name, pass.pass_class());
    if let Some(template) = &pass.template {
        for slot in &template.slots {
            log::debug!("[dist]   slot {} {}", slot.name, slot.slot_type.label());
        }
        for c in &template.connections {
            log::debug!(
                "[dist]   template {} -> {}.{}",
                c.local_slot,
                c.attachment_ref.pass,
                c.attachment_ref.attachment
            );
        }
    }
    for c in &pass.connections {
        log::debug!(
            "[dist]   conn {} -> {}.{}",
            c.local_slot,
            c.attachment_ref.pass,
            c.attachment_ref.attachment
        );
    }
    for b in &pass.bindings {
        let att = b.attachment.as_ref().map_or("<unbound>".to_string(), |a| a.key());
        log::debug!("[dist]   binding {} {} = {att}", b.name, b.slot_type.label());
    }
}

/// Renders the tree under `root` as Graphviz DOT: parents as clusters, leaves as
/// nodes, connections as edges from the referenced pass.
pub fn graph_to_dot(sys: &dyn PassSystem, root: PassId) -> String {
    let mut out = String::from("digraph passes {\n  rankdir=LR;\n  node [shape=box];\n");
    let mut edges = String::new();
    write_pass(sys, root, 1, &mut out, &mut edges);
    out.push_str(&edges);
    out.push_str("}\n");
    out
}

fn write_pass(sys: &dyn PassSystem, id: PassId, depth: usize, out: &mut String, edges: &mut String) {
    let Some(pass) = sys.pass(id) else { return };
    let pad = "  ".repeat(depth);
    if pass.is_parent() {
        let _ = writeln!(out, "{pad}subgraph \"cluster_{}\" {{", pass.name);
        let _ = writeln!(out, "{pad}  label=\"{}\";", pass.name);
        for child in pass.children() {
            write_pass(sys, *child, depth + 1, out, edges);
        }
        let _ = writeln!(out, "{pad}}}");
        return;
    }

    let style = if pass.comm.is_some() { ", style=dashed" } else { "" };
    let _ = writeln!(
        out,
        "{pad}\"{}\" [label=\"{}\\n{}\"{style}];",
        pass.name,
        pass.name,
        pass.pass_class()
    );
    for c in &pass.connections {
        if c.attachment_ref.pass == crate::pass_graph::THIS_PASS
            || c.attachment_ref.pass == pass.name
        {
            continue;
        }
        let _ = writeln!(
            edges,
            "  \"{}\" -> \"{}\" [label=\"{} > {}\"];",
            c.attachment_ref.pass, pass.name, c.attachment_ref.attachment, c.local_slot
        );
    }
}
