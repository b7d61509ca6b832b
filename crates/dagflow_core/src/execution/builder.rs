//! Turning a validated plan into an operator tree.

use std::sync::Arc;

use dagflow_error::{DbError, OptionExt, Result, ResultExt};

use super::discipline::CallDiscipline;
use super::operators::cartesian::PhysicalCartesian;
use super::operators::exchange::PhysicalExchange;
use super::operators::group::PhysicalGroupBy;
use super::operators::join::{PhysicalAntiJoin, PhysicalHashJoin, PhysicalSemiJoin};
use super::operators::map::{PhysicalFilter, PhysicalMap};
use super::operators::materialize::{
    MaterializeLayout, PhysicalEnsureSingleTuple, PhysicalMaterialize, PhysicalMaterializeParquet,
    PhysicalParquetScan,
};
use super::operators::parallel::{PhysicalParallelMap, PhysicalParallelMapPool};
use super::operators::partition::PhysicalPartition;
use super::operators::pattern::PhysicalExpandPattern;
use super::operators::pipeline::{PhysicalCompiledPipeline, PhysicalPipeline};
use super::operators::reduce::{
    PhysicalReduce, PhysicalReduceByIndex, PhysicalReduceByKey, PhysicalReduceByKeyGrouped,
};
use super::operators::scan::{PhysicalScan, ScanLayout};
use super::operators::sort::{PhysicalSort, PhysicalTopK};
use super::operators::source::{
    PhysicalConstantTuple, PhysicalParameterLookup, PhysicalRangeSource, PhysicalSplitRange,
};
use super::operators::zip::PhysicalZip;
use super::{BoxedOperator, ExecutionContext};
use crate::functions::FunctionRegistry;
use crate::plan::dag::Dag;
use crate::plan::kind::{OperatorKind, Parallelism};
use crate::plan::operator::{DagOperator, OperatorId};

/// Already built inputs of an operator, in port order.
struct Inputs(std::vec::IntoIter<BoxedOperator>);

impl Inputs {
    fn take(&mut self) -> Result<BoxedOperator> {
        self.0
            .next()
            .ok_or_else(|| DbError::plan("Operator is missing an input"))
    }

    fn rest(self) -> Vec<BoxedOperator> {
        self.0.collect()
    }
}

/// Builds operator trees from plans.
///
/// The tree is built from the sink. A producer feeding several consumers is
/// built once per consumer, so every operator instance has exactly one
/// consumer driving it.
#[derive(Debug, Clone, Copy)]
pub struct PlanBuilder<'a> {
    functions: &'a FunctionRegistry,
    verify_call_discipline: bool,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(functions: &'a FunctionRegistry, verify_call_discipline: bool) -> Self {
        PlanBuilder {
            functions,
            verify_call_discipline,
        }
    }

    pub fn from_context(ctx: &'a ExecutionContext) -> Self {
        Self::new(&ctx.functions, ctx.config.verify_call_discipline)
    }

    /// Validate the plan and build the tree rooted at its sink.
    pub fn build(&self, dag: &Dag) -> Result<BoxedOperator> {
        dag.validate()?;
        let sink = dag.sink()?;
        self.build_operator(dag, sink)
    }

    fn build_operator(&self, dag: &Dag, id: OperatorId) -> Result<BoxedOperator> {
        let op = dag.operator(id)?;
        let inputs = dag
            .inputs(id)?
            .into_iter()
            .map(|input| self.build_operator(dag, input))
            .collect::<Result<Vec<_>>>()?;

        let physical = self
            .build_kind(op, Inputs(inputs.into_iter()))
            .context_fn(|| format!("Failed to build operator {} ({})", op.id, op.name()))?;
        tracing::trace!(id = %op.id, operator = physical.name(), "built operator");

        if self.verify_call_discipline {
            Ok(Box::new(CallDiscipline::new(
                physical,
                op.kind.caches_build_state(),
            )))
        } else {
            Ok(physical)
        }
    }

    fn build_kind(&self, op: &DagOperator, mut inputs: Inputs) -> Result<BoxedOperator> {
        let code = || op.code.as_deref().required("code");

        let physical: BoxedOperator = match &op.kind {
            OperatorKind::Map => Box::new(PhysicalMap::new(
                inputs.take()?,
                self.functions.get_map(code()?)?,
            )),
            OperatorKind::Filter => Box::new(PhysicalFilter::new(
                inputs.take()?,
                self.functions.get_predicate(code()?)?,
            )),
            OperatorKind::Join(p) => Box::new(PhysicalHashJoin::new(
                inputs.take()?,
                inputs.take()?,
                p.num_keys,
            )),
            OperatorKind::SemiJoin(p) => Box::new(PhysicalSemiJoin::new(
                inputs.take()?,
                inputs.take()?,
                p.num_keys,
            )),
            OperatorKind::AntiJoin(p) => Box::new(PhysicalAntiJoin::new(
                inputs.take()?,
                inputs.take()?,
                p.num_keys,
                self.functions.get_anti_join_predicate(code()?)?,
            )),
            OperatorKind::GroupBy(p) => Box::new(PhysicalGroupBy::new(inputs.take()?, p.num_keys)),
            OperatorKind::ReduceByKey(p) => Box::new(PhysicalReduceByKey::new(
                inputs.take()?,
                p.num_keys,
                self.functions.get_reducer(code()?)?,
            )),
            OperatorKind::ReduceByKeyGrouped(p) => Box::new(PhysicalReduceByKeyGrouped::new(
                inputs.take()?,
                p.num_keys,
                self.functions.get_reducer(code()?)?,
            )),
            OperatorKind::ReduceByIndex(p) => Box::new(PhysicalReduceByIndex::new(
                inputs.take()?,
                p.min,
                p.max,
                self.functions.get_reducer(code()?)?,
            )),
            OperatorKind::Reduce => Box::new(PhysicalReduce::new(
                inputs.take()?,
                self.functions.get_reducer(code()?)?,
            )),
            OperatorKind::Partition(p) => Box::new(PhysicalPartition::new(
                inputs.take()?,
                inputs.take()?,
                *p,
            )),
            OperatorKind::Cartesian => {
                Box::new(PhysicalCartesian::new(inputs.take()?, inputs.take()?))
            }
            OperatorKind::Sort(p) => Box::new(PhysicalSort::new(inputs.take()?, p.key_column)),
            OperatorKind::TopK(p) => {
                Box::new(PhysicalTopK::new(inputs.take()?, p.n, p.key_column))
            }
            OperatorKind::Zip(_) => Box::new(PhysicalZip::new(inputs.rest())),
            OperatorKind::RangeSource(p) => Box::new(PhysicalRangeSource::new(*p)),
            OperatorKind::RowScan => Box::new(PhysicalScan::new(ScanLayout::Rows, inputs.take()?)),
            OperatorKind::ColumnScan => {
                Box::new(PhysicalScan::new(ScanLayout::Columns, inputs.take()?))
            }
            OperatorKind::SplitRowData => Box::new(PhysicalScan::new_split(
                ScanLayout::Rows,
                inputs.take()?,
                inputs.take()?,
                inputs.take()?,
            )),
            OperatorKind::SplitColumnData => Box::new(PhysicalScan::new_split(
                ScanLayout::Columns,
                inputs.take()?,
                inputs.take()?,
                inputs.take()?,
            )),
            OperatorKind::SplitRange(p) => Box::new(PhysicalSplitRange::new(
                inputs.take()?,
                inputs.take()?,
                *p,
            )),
            OperatorKind::ParallelMap(p) => {
                let inner = self.build(&p.inner)?;
                Box::new(PhysicalParallelMap::new(inputs.take()?, inner))
            }
            OperatorKind::ParallelMapPool(p) => {
                if p.parallelism == Parallelism::Unresolved {
                    return Err(DbError::plan(
                        "Parallelism of a pooled parallel map was never resolved",
                    ));
                }
                // Every task builds its own tree, build one now to surface
                // plan errors before execution.
                self.build(&p.inner)?;
                Box::new(PhysicalParallelMapPool::new(
                    inputs.take()?,
                    Arc::new((*p.inner).clone()),
                    p.parallelism,
                ))
            }
            OperatorKind::Pipeline(p) => {
                let inner = self.build(&p.inner)?;
                Box::new(PhysicalPipeline::new(inputs.rest(), inner))
            }
            OperatorKind::CompiledPipeline(p) => {
                p.inner.validate()?;
                Box::new(PhysicalCompiledPipeline::new(
                    inputs.rest(),
                    p.function_name.clone(),
                    Arc::new((*p.inner).clone()),
                ))
            }
            OperatorKind::ExpandPattern(p) => {
                Box::new(PhysicalExpandPattern::new(inputs.take()?, p.pattern.clone()))
            }
            OperatorKind::ConstantTuple(p) => Box::new(PhysicalConstantTuple::new(p.value.clone())),
            OperatorKind::ParameterLookup(p) => Box::new(PhysicalParameterLookup::new(p.index)),
            OperatorKind::EnsureSingleTuple => {
                Box::new(PhysicalEnsureSingleTuple::new(inputs.take()?))
            }
            OperatorKind::MaterializeRowVector => Box::new(PhysicalMaterialize::new(
                inputs.take()?,
                MaterializeLayout::RowVector,
            )),
            OperatorKind::MaterializeColumnChunks => Box::new(PhysicalMaterialize::new(
                inputs.take()?,
                MaterializeLayout::ColumnChunks,
            )),
            OperatorKind::MaterializeParquet(p) => Box::new(PhysicalMaterializeParquet::new(
                inputs.take()?,
                p.path.clone(),
            )),
            OperatorKind::ParquetScan(p) => Box::new(PhysicalParquetScan::new(p.clone())),
            OperatorKind::Exchange(p) => Box::new(PhysicalExchange::new(
                inputs.take()?,
                inputs.take()?,
                p.exchange_id.clone(),
            )),
        };

        Ok(physical)
    }
}

#[cfg(test)]
mod tests {
    use dagflow_error::ErrorKind;

    use super::*;
    use crate::column::TupleSchema;
    use crate::plan::kind::{ParallelMapParams, ParameterParams, RangeParams, TopKParams};
    use crate::testutil::{leading_ints, test_context, test_context_with_functions};
    use crate::value::Value;

    fn add(dag: &mut Dag, op: DagOperator) -> OperatorId {
        dag.add_operator(op).unwrap()
    }

    fn range(to: i64) -> DagOperator {
        DagOperator::new(
            OperatorKind::RangeSource(RangeParams { from: 0, to, step: 1 }),
            TupleSchema::default(),
        )
    }

    fn run(root: &mut BoxedOperator, ctx: &ExecutionContext) -> Vec<Value> {
        crate::execution::util::drain(root, ctx).unwrap()
    }

    #[test]
    fn builds_and_runs_top_k() {
        let mut dag = Dag::new();
        let src = add(&mut dag, range(10));
        let topk = add(
            &mut dag,
            DagOperator::new(
                OperatorKind::TopK(TopKParams { n: 3, key_column: 0 }),
                TupleSchema::default(),
            ),
        );
        dag.connect(src, 0, topk, 0).unwrap();

        let ctx = test_context();
        let mut root = PlanBuilder::from_context(&ctx).build(&dag).unwrap();
        assert_eq!(vec![9, 8, 7], leading_ints(&run(&mut root, &ctx)));
    }

    #[test]
    fn unknown_function_is_plan_error() {
        let mut dag = Dag::new();
        let src = add(&mut dag, range(3));
        let map = add(
            &mut dag,
            DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("missing"),
        );
        dag.connect(src, 0, map, 0).unwrap();

        let ctx = test_context();
        let err = PlanBuilder::from_context(&ctx).build(&dag).unwrap_err();
        assert_eq!(ErrorKind::PlanMalformed, err.kind());
    }

    #[test]
    fn shared_producer_built_per_consumer() {
        fn first(v: &Value) -> Result<Value> {
            Ok(Value::tuple([v.field(0)?.clone()]))
        }
        let mut functions = FunctionRegistry::new();
        functions.register_map("first", first);

        // Range feeding both sides of a join.
        let mut dag = Dag::new();
        let src = add(&mut dag, range(4));
        let left = add(
            &mut dag,
            DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("first"),
        );
        let right = add(
            &mut dag,
            DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("first"),
        );
        let join = add(
            &mut dag,
            DagOperator::new(
                OperatorKind::Join(crate::plan::kind::JoinParams { num_keys: 1 }),
                TupleSchema::default(),
            ),
        );
        dag.connect(src, 0, left, 0).unwrap();
        dag.connect(src, 0, right, 0).unwrap();
        dag.connect(left, 0, join, 0).unwrap();
        dag.connect(right, 0, join, 1).unwrap();

        let ctx = test_context_with_functions(functions);
        let mut root = PlanBuilder::from_context(&ctx).build(&dag).unwrap();
        let mut keys = leading_ints(&run(&mut root, &ctx));
        keys.sort();
        assert_eq!(vec![0, 1, 2, 3], keys);
    }

    #[test]
    fn unresolved_pool_rejected() {
        let mut inner = Dag::new();
        add(
            &mut inner,
            DagOperator::new(
                OperatorKind::ParameterLookup(ParameterParams { index: 0 }),
                TupleSchema::default(),
            ),
        );

        let mut dag = Dag::new();
        let src = add(&mut dag, range(3));
        let pool = add(
            &mut dag,
            DagOperator::new(
                OperatorKind::ParallelMapPool(ParallelMapParams {
                    inner: Box::new(inner),
                    parallelism: Parallelism::Unresolved,
                }),
                TupleSchema::default(),
            ),
        );
        dag.connect(src, 0, pool, 0).unwrap();

        let ctx = test_context();
        let err = PlanBuilder::from_context(&ctx).build(&dag).unwrap_err();
        assert_eq!(ErrorKind::PlanMalformed, err.kind());
    }
}
