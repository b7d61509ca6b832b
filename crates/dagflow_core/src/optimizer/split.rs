use dagflow_error::Result;

use super::{OptimizeRule, OptimizerContext};
use crate::plan::dag::Dag;
use crate::plan::kind::{OperatorKind, ParameterParams};
use crate::plan::operator::{DagOperator, OperatorId};

/// Parameter index holding the worker's index at the top level of a plan.
pub const WORKER_INDEX_PARAMETER: usize = 0;
/// Parameter index holding the number of workers.
pub const WORKER_COUNT_PARAMETER: usize = 1;

/// Get the partition aware counterpart of a scan or source.
///
/// Returns None for kinds that can't be split.
pub fn make_split_operator(kind: &OperatorKind) -> Option<OperatorKind> {
    match kind {
        OperatorKind::ColumnScan => Some(OperatorKind::SplitColumnData),
        OperatorKind::RowScan => Some(OperatorKind::SplitRowData),
        OperatorKind::RangeSource(params) => Some(OperatorKind::SplitRange(*params)),
        OperatorKind::Map
        | OperatorKind::Filter
        | OperatorKind::Join(_)
        | OperatorKind::SemiJoin(_)
        | OperatorKind::AntiJoin(_)
        | OperatorKind::GroupBy(_)
        | OperatorKind::ReduceByKey(_)
        | OperatorKind::ReduceByKeyGrouped(_)
        | OperatorKind::ReduceByIndex(_)
        | OperatorKind::Reduce
        | OperatorKind::Partition(_)
        | OperatorKind::Cartesian
        | OperatorKind::Sort(_)
        | OperatorKind::TopK(_)
        | OperatorKind::Zip(_)
        | OperatorKind::SplitRowData
        | OperatorKind::SplitColumnData
        | OperatorKind::SplitRange(_)
        | OperatorKind::ParallelMap(_)
        | OperatorKind::ParallelMapPool(_)
        | OperatorKind::Pipeline(_)
        | OperatorKind::CompiledPipeline(_)
        | OperatorKind::ExpandPattern(_)
        | OperatorKind::ConstantTuple(_)
        | OperatorKind::ParameterLookup(_)
        | OperatorKind::EnsureSingleTuple
        | OperatorKind::MaterializeRowVector
        | OperatorKind::MaterializeColumnChunks
        | OperatorKind::MaterializeParquet(_)
        | OperatorKind::ParquetScan(_)
        | OperatorKind::Exchange(_) => None,
    }
}

/// Port receiving the slice index on a split operator. The slice count goes
/// to the port after it.
fn slice_port(kind: &OperatorKind) -> usize {
    match kind {
        OperatorKind::SplitRange(_) => 0,
        _ => 1,
    }
}

/// Rewrites scans in the top level plan to read only this worker's slice.
///
/// Each split operator gets its slice index and count from parameter lookups
/// of the worker index and worker count.
#[derive(Debug, Default)]
pub struct InjectSplits {
    /// Operators rewritten by the last run.
    pub rewritten: Vec<OperatorId>,
}

impl OptimizeRule for InjectSplits {
    fn name(&self) -> &'static str {
        "inject_splits"
    }

    fn optimize(&mut self, ctx: &OptimizerContext, dag: &mut Dag) -> Result<()> {
        self.rewritten.clear();

        let candidates: Vec<(OperatorId, OperatorKind)> = dag
            .topological_order()?
            .into_iter()
            .filter_map(|id| {
                let op = dag.operator(id).ok()?;
                make_split_operator(&op.kind).map(|kind| (id, kind))
            })
            .collect();

        for (id, split_kind) in candidates {
            let port = slice_port(&split_kind);
            let old = dag.operator(id)?.clone();
            dag.replace_operator(
                id,
                DagOperator {
                    kind: split_kind,
                    ..old
                },
            )?;

            for (offset, index) in [WORKER_INDEX_PARAMETER, WORKER_COUNT_PARAMETER]
                .into_iter()
                .enumerate()
            {
                let output = dag.columns.new_atomic_tuple([ctx.types.int64()])?;
                let lookup = dag.add_operator(DagOperator::new(
                    OperatorKind::ParameterLookup(ParameterParams { index }),
                    output,
                ))?;
                dag.connect(lookup, 0, id, port + offset)?;
            }

            tracing::debug!(%id, kind = dag.operator(id)?.name(), "injected split");
            self.rewritten.push(id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::TupleSchema;
    use crate::plan::kind::RangeParams;
    use crate::types::TypeTable;

    #[test]
    fn split_counterparts() {
        assert_eq!(
            Some(OperatorKind::SplitColumnData),
            make_split_operator(&OperatorKind::ColumnScan)
        );
        assert_eq!(
            Some(OperatorKind::SplitRowData),
            make_split_operator(&OperatorKind::RowScan)
        );
        let range = RangeParams { from: 0, to: 100, step: 2 };
        assert_eq!(
            Some(OperatorKind::SplitRange(range)),
            make_split_operator(&OperatorKind::RangeSource(range))
        );
        assert_eq!(None, make_split_operator(&OperatorKind::Map));
    }

    #[test]
    fn inject_into_range_and_row_scan() {
        let types = TypeTable::new();
        let mut dag = Dag::new();
        let range = dag
            .add_operator(DagOperator::new(
                OperatorKind::RangeSource(RangeParams { from: 0, to: 10, step: 1 }),
                TupleSchema::default(),
            ))
            .unwrap();
        let mat = dag
            .add_operator(DagOperator::new(
                OperatorKind::MaterializeRowVector,
                TupleSchema::default(),
            ))
            .unwrap();
        let scan = dag
            .add_operator(DagOperator::new(OperatorKind::RowScan, TupleSchema::default()))
            .unwrap();
        dag.connect(range, 0, mat, 0).unwrap();
        dag.connect(mat, 0, scan, 0).unwrap();

        let mut rule = InjectSplits::default();
        rule.optimize(&OptimizerContext { types: &types }, &mut dag)
            .unwrap();

        assert_eq!(vec![range, scan], rule.rewritten);
        assert_eq!("split_range", dag.operator(range).unwrap().name());
        assert_eq!("split_row_data", dag.operator(scan).unwrap().name());
        assert_eq!(mat, dag.input(scan, 0).unwrap());

        for (op, port) in [(range, 0), (scan, 1)] {
            let idx = dag.input(op, port).unwrap();
            let count = dag.input(op, port + 1).unwrap();
            assert_eq!(
                OperatorKind::ParameterLookup(ParameterParams { index: 0 }),
                dag.operator(idx).unwrap().kind
            );
            assert_eq!(
                OperatorKind::ParameterLookup(ParameterParams { index: 1 }),
                dag.operator(count).unwrap().kind
            );
        }
        dag.validate().unwrap();
    }
}
