//! Plan model: operators, flows and nested plans.

pub mod dag;
pub mod kind;
pub mod operator;
pub mod record;
