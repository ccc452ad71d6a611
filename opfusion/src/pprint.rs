use prettytable::{format, row, Table};

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::fusion::FusionStats;
use crate::graph::{Graph, Node};
use crate::pipeline::CompileReport;
use crate::utils::{indent, join_into_string};

/// Pretty-print a [Graph] to stdout.
pub fn pprint_graph(graph: &Graph) {
    graph_table(graph).printstd()
}

pub fn graph_string(graph: &Graph) -> String {
    format!("{}", graph_table(graph))
}

/// Writes the table of `graph` to `path`, creating parent directories as needed.
pub fn dump_graph(graph: &Graph, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    writeln!(file, "graph {} (version {})", graph.name, graph.version())?;
    graph_table(graph).print(&mut file)?;
    Ok(())
}

/// Pretty-print the statistics and warnings of a [CompileReport] to stdout.
pub fn pprint_report(report: &CompileReport) {
    stats_table(&report.stats).printstd();
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
}

pub fn stats_table(stats: &FusionStats) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Pattern / pass", r->"Matched", r->"Applied"]);
    for (name, s) in stats.iter() {
        table.add_row(row![name, r->s.matched, r->s.applied]);
    }
    table.set_format(plain_format());
    table
}

fn graph_table(graph: &Graph) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Id", "Node", "Type", "Kernel", "Inputs", "Outputs"]);
    match graph.topo_order() {
        Ok(order) => {
            for node in order.into_iter().filter_map(|id| graph.node(id).ok()) {
                add_node_rows(&mut table, node, 0);
            }
        }
        // Dumps are diagnostics; show what is there even if the graph is broken.
        Err(_) => {
            for node in graph.nodes() {
                add_node_rows(&mut table, node, 0);
            }
        }
    }
    if graph.control_edges().next().is_some() {
        let edges = join_into_string(graph.control_edges().map(|(a, b)| format!("{a}->{b}")), " ");
        table.add_row(row!["", "control", "", "", edges, ""]);
    }
    table.set_format(plain_format());
    table
}

fn add_node_rows(table: &mut Table, node: &Node, depth: usize) {
    let kernel = match &node.op.kernel {
        Some(k) if k.compiled.is_some() => format!("{} [{}]*", k.candidate, k.column),
        Some(k) => format!("{} [{}]", k.candidate, k.column),
        None => String::new(),
    };
    let slots = |slots: &[crate::graph::TensorSlot]| {
        join_into_string(slots.iter().map(|s| format!("{}: {}", s.name, s.desc)), "\n")
    };
    table.add_row(row![
        node.id,
        format!("{}{}", indent(depth), node.name),
        node.op.op_type,
        kernel,
        slots(&node.op.inputs),
        slots(&node.op.outputs)
    ]);
    if let Some(body) = &node.op.fused {
        for member in &body.members {
            add_node_rows(table, member, depth + 1);
        }
    }
}

fn plain_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}
