//! Operator implementations, one per plan operator kind.

pub mod cartesian;
pub mod exchange;
pub mod group;
pub mod join;
pub mod map;
pub mod materialize;
pub mod parallel;
pub mod partition;
pub mod pattern;
pub mod pipeline;
pub mod reduce;
pub mod scan;
pub mod sort;
pub mod source;
pub mod zip;
