pub mod attr;
pub mod backend;
pub mod catalog;
pub mod common;
pub mod config;
pub mod descriptor;
pub mod fusion;
pub mod generalize;
pub mod graph;
pub mod matcher;
pub mod passes;
pub mod pipeline;
pub mod pprint;
pub mod propagate;
pub mod strategy;
pub mod tensor;
pub mod utils;

#[cfg(test)]
mod testing;
