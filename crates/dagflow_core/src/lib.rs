//! Dataflow plans: a typed DAG model, rewrite passes, pipeline partitioning
//! and pull based execution.

pub mod column;
pub mod config;
pub mod execution;
pub mod functions;
pub mod optimizer;
pub mod pipeline;
pub mod plan;
pub mod runtime;
pub mod types;
pub mod value;

pub mod testutil;
