use itertools::Itertools;

use std::fmt::Display;

const INDENT_SIZE: usize = 2;

/// Formats every item of `items` and places `separator` between them.
pub fn join_into_string(items: impl IntoIterator<Item = impl Display>, separator: &str) -> String {
    items.into_iter().join(separator)
}

/// Leading whitespace for a row nested `depth` levels deep in a table.
pub fn indent(depth: usize) -> String {
    format!("{:width$}", "", width = depth * INDENT_SIZE)
}

/// Rounds `value` up to the next multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment).saturating_mul(alignment)
}
