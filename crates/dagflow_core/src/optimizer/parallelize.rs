use std::collections::HashSet;

use dagflow_error::Result;

use super::visit::{DagVisitor, VisitOutcome, apply_in_topological_order_recursively};
use super::{OptimizeRule, OptimizerContext};
use crate::plan::dag::Dag;
use crate::plan::kind::{OperatorKind, ParallelMapParams, Parallelism};
use crate::plan::operator::{DagOperator, OperatorId};

/// Replaces every parallel map the sink depends on with its pooled variant,
/// and resolves the parallelism placeholder to the runtime worker count.
#[derive(Debug, Default)]
pub struct Parallelize {
    /// Operators reachable from the sink, one entry per DAG being visited.
    reachable: Vec<HashSet<OperatorId>>,
    /// Number of operators replaced by the last run.
    pub replaced: usize,
}

fn resolve(parallelism: Parallelism) -> Parallelism {
    match parallelism {
        Parallelism::Unresolved => Parallelism::RuntimeWorkers,
        other => other,
    }
}

impl DagVisitor for Parallelize {
    fn enter_dag(&mut self, dag: &Dag) -> Result<()> {
        self.reachable.push(dag.reachable_from_sink()?);
        Ok(())
    }

    fn exit_dag(&mut self, _dag: &Dag) -> Result<()> {
        self.reachable.pop();
        Ok(())
    }

    fn visit(&mut self, op: &mut DagOperator) -> Result<VisitOutcome> {
        let reachable = self
            .reachable
            .last()
            .is_some_and(|set| set.contains(&op.id));

        match &mut op.kind {
            OperatorKind::ParallelMap(params) if reachable => {
                let kind = OperatorKind::ParallelMapPool(ParallelMapParams {
                    inner: params.inner.clone(),
                    parallelism: resolve(params.parallelism),
                });
                let new = DagOperator {
                    kind,
                    ..op.clone()
                };
                self.replaced += 1;
                Ok(VisitOutcome::Replace(new))
            }
            OperatorKind::ParallelMap(_) => {
                tracing::warn!(id = %op.id, "parallel map not reachable from sink, leaving as is");
                Ok(VisitOutcome::Keep)
            }
            OperatorKind::ParallelMapPool(params) => {
                params.parallelism = resolve(params.parallelism);
                Ok(VisitOutcome::Keep)
            }
            _ => Ok(VisitOutcome::Keep),
        }
    }
}

impl OptimizeRule for Parallelize {
    fn name(&self) -> &'static str {
        "parallelize"
    }

    fn optimize(&mut self, _ctx: &OptimizerContext, dag: &mut Dag) -> Result<()> {
        self.replaced = 0;
        self.reachable.clear();
        apply_in_topological_order_recursively(dag, self)?;
        tracing::debug!(replaced = self.replaced, "parallelized plan");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::TupleSchema;
    use crate::plan::kind::{ParameterParams, RangeParams};
    use crate::types::TypeTable;

    fn inner_plan() -> Dag {
        let mut inner = Dag::new();
        let p = inner
            .add_operator(DagOperator::new(
                OperatorKind::ParameterLookup(ParameterParams { index: 0 }),
                TupleSchema::default(),
            ))
            .unwrap();
        let m = inner
            .add_operator(DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("f"))
            .unwrap();
        inner.connect(p, 0, m, 0).unwrap();
        inner
    }

    fn pmap(parallelism: Parallelism) -> DagOperator {
        DagOperator::new(
            OperatorKind::ParallelMap(ParallelMapParams {
                inner: Box::new(inner_plan()),
                parallelism,
            }),
            TupleSchema::default(),
        )
    }

    #[test]
    fn replaces_reachable_parallel_maps() {
        let mut dag = Dag::new();
        let src = dag
            .add_operator(DagOperator::new(
                OperatorKind::RangeSource(RangeParams { from: 0, to: 4, step: 1 }),
                TupleSchema::default(),
            ))
            .unwrap();
        let a = dag.add_operator(pmap(Parallelism::Unresolved)).unwrap();
        let b = dag.add_operator(pmap(Parallelism::Fixed(3))).unwrap();
        dag.connect(src, 0, a, 0).unwrap();
        dag.connect(a, 0, b, 0).unwrap();

        let types = TypeTable::new();
        let mut rule = Parallelize::default();
        rule.optimize(&OptimizerContext { types: &types }, &mut dag)
            .unwrap();

        assert_eq!(2, rule.replaced);
        match &dag.operator(a).unwrap().kind {
            OperatorKind::ParallelMapPool(p) => {
                assert_eq!(Parallelism::RuntimeWorkers, p.parallelism)
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        match &dag.operator(b).unwrap().kind {
            OperatorKind::ParallelMapPool(p) => assert_eq!(Parallelism::Fixed(3), p.parallelism),
            other => panic!("unexpected kind: {other:?}"),
        }
        dag.validate().unwrap();
    }

    #[test]
    fn nested_parallel_map_replaced() {
        // Parallel map nested inside another parallel map's plan.
        let mut inner = inner_plan();
        let sink = inner.sink().unwrap();
        let nested = inner.add_operator(pmap(Parallelism::Unresolved)).unwrap();
        inner.connect(sink, 0, nested, 0).unwrap();

        let mut dag = Dag::new();
        let src = dag
            .add_operator(DagOperator::new(
                OperatorKind::RangeSource(RangeParams { from: 0, to: 4, step: 1 }),
                TupleSchema::default(),
            ))
            .unwrap();
        let outer = dag
            .add_operator(DagOperator::new(
                OperatorKind::ParallelMap(ParallelMapParams {
                    inner: Box::new(inner),
                    parallelism: Parallelism::Fixed(2),
                }),
                TupleSchema::default(),
            ))
            .unwrap();
        dag.connect(src, 0, outer, 0).unwrap();

        let types = TypeTable::new();
        let mut rule = Parallelize::default();
        rule.optimize(&OptimizerContext { types: &types }, &mut dag)
            .unwrap();
        assert_eq!(2, rule.replaced);

        let inner = dag.operator(outer).unwrap().kind.nested().unwrap();
        assert_eq!(
            "parallel_map_pool",
            inner.operator(nested).unwrap().name()
        );
    }
}
