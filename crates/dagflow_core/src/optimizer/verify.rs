use dagflow_error::{Result, ResultExt};

use super::{OptimizeRule, OptimizerContext};
use crate::plan::dag::Dag;

/// Final check that rewrites left a well formed plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyPlan;

fn check_read_sets_recursive(dag: &Dag) -> Result<()> {
    dag.check_read_sets()?;
    for op in dag.operators() {
        if let Some(nested) = op.kind.nested() {
            check_read_sets_recursive(nested)
                .context_fn(|| format!("Invalid nested plan for {}", op.id))?;
        }
    }
    Ok(())
}

impl OptimizeRule for VerifyPlan {
    fn name(&self) -> &'static str {
        "verify_plan"
    }

    fn optimize(&mut self, _ctx: &OptimizerContext, dag: &mut Dag) -> Result<()> {
        dag.validate()?;
        check_read_sets_recursive(dag)
    }
}
