pub mod parallelize;
pub mod split;
pub mod verify;
pub mod visit;

use dagflow_error::Result;

use crate::plan::dag::Dag;
use crate::types::TypeTable;
use parallelize::Parallelize;
use verify::VerifyPlan;

/// Shared state available to every rule.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerContext<'a> {
    pub types: &'a TypeTable,
}

pub trait OptimizeRule {
    fn name(&self) -> &'static str;

    /// Apply the rule to the plan, rewriting it in place.
    fn optimize(&mut self, ctx: &OptimizerContext, dag: &mut Dag) -> Result<()>;
}

/// Runs a list of rules in order.
pub struct Optimizer {
    rules: Vec<Box<dyn OptimizeRule>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    /// Default rule set: parallelize, then verify.
    pub fn new() -> Self {
        Self::with_rules(vec![Box::new(Parallelize::default()), Box::new(VerifyPlan)])
    }

    pub fn with_rules(rules: Vec<Box<dyn OptimizeRule>>) -> Self {
        Optimizer { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn optimize(&mut self, ctx: &OptimizerContext, dag: &mut Dag) -> Result<()> {
        for rule in &mut self.rules {
            tracing::debug!(rule = rule.name(), "applying optimizer rule");
            rule.optimize(ctx, dag)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("rules", &self.rule_names())
            .finish()
    }
}
