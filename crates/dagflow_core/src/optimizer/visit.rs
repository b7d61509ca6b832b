use dagflow_error::Result;

use crate::plan::dag::Dag;
use crate::plan::operator::DagOperator;

#[derive(Debug)]
pub enum VisitOutcome {
    /// Keep the operator, including any in-place parameter changes.
    Keep,
    /// Replace the whole operator. The replacement takes over the old id.
    Replace(DagOperator),
}

pub trait DagVisitor {
    /// Called before visiting the operators of a DAG, including nested ones.
    fn enter_dag(&mut self, _dag: &Dag) -> Result<()> {
        Ok(())
    }

    /// Called after every operator of a DAG was visited.
    fn exit_dag(&mut self, _dag: &Dag) -> Result<()> {
        Ok(())
    }

    fn visit(&mut self, op: &mut DagOperator) -> Result<VisitOutcome>;
}

/// Visit every operator in dependency order.
///
/// A nested DAG is fully visited before the operator that owns it.
pub fn apply_in_topological_order_recursively<V>(dag: &mut Dag, visitor: &mut V) -> Result<()>
where
    V: DagVisitor + ?Sized,
{
    visitor.enter_dag(dag)?;

    for id in dag.topological_order()? {
        if let Some(nested) = dag.operator_mut(id)?.kind.nested_mut() {
            apply_in_topological_order_recursively(nested, visitor)?;
        }

        let op = dag.operator_mut(id)?;
        match visitor.visit(op)? {
            VisitOutcome::Keep => (),
            VisitOutcome::Replace(new) => {
                tracing::debug!(%id, from = op.name(), to = new.name(), "replacing operator");
                dag.replace_operator(id, new)?;
            }
        }
    }

    visitor.exit_dag(dag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::TupleSchema;
    use crate::plan::kind::{OperatorKind, PipelineParams, RangeParams};
    use crate::plan::operator::OperatorId;

    #[derive(Default)]
    struct Recorder {
        visited: Vec<(usize, OperatorId)>,
        depth: usize,
    }

    impl DagVisitor for Recorder {
        fn enter_dag(&mut self, _dag: &Dag) -> Result<()> {
            self.depth += 1;
            Ok(())
        }

        fn exit_dag(&mut self, _dag: &Dag) -> Result<()> {
            self.depth -= 1;
            Ok(())
        }

        fn visit(&mut self, op: &mut DagOperator) -> Result<VisitOutcome> {
            self.visited.push((self.depth, op.id));
            Ok(VisitOutcome::Keep)
        }
    }

    fn range() -> DagOperator {
        DagOperator::new(
            OperatorKind::RangeSource(RangeParams { from: 0, to: 3, step: 1 }),
            TupleSchema::default(),
        )
    }

    #[test]
    fn nested_visited_before_owner() {
        let mut inner = Dag::new();
        let a = inner.add_operator(range()).unwrap();
        let b = inner
            .add_operator(DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("f"))
            .unwrap();
        inner.connect(a, 0, b, 0).unwrap();

        let mut dag = Dag::new();
        let src = dag.add_operator(range()).unwrap();
        let pipeline = dag
            .add_operator(DagOperator::new(
                OperatorKind::Pipeline(PipelineParams {
                    inner: Box::new(inner),
                    num_inputs: 1,
                }),
                TupleSchema::default(),
            ))
            .unwrap();
        dag.connect(src, 0, pipeline, 0).unwrap();

        let mut recorder = Recorder::default();
        apply_in_topological_order_recursively(&mut dag, &mut recorder).unwrap();

        assert_eq!(
            vec![(1, src), (2, a), (2, b), (1, pipeline)],
            recorder.visited
        );
        assert_eq!(0, recorder.depth);
    }

    #[test]
    fn replacement_keeps_id() {
        struct ToFilter;
        impl DagVisitor for ToFilter {
            fn visit(&mut self, op: &mut DagOperator) -> Result<VisitOutcome> {
                Ok(match op.kind {
                    OperatorKind::Map => VisitOutcome::Replace(
                        DagOperator::new(OperatorKind::Filter, op.output.clone())
                            .with_code(op.code.clone().unwrap_or_default()),
                    ),
                    _ => VisitOutcome::Keep,
                })
            }
        }

        let mut dag = Dag::new();
        let src = dag.add_operator(range()).unwrap();
        let map = dag
            .add_operator(DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("f"))
            .unwrap();
        dag.connect(src, 0, map, 0).unwrap();

        apply_in_topological_order_recursively(&mut dag, &mut ToFilter).unwrap();
        let op = dag.operator(map).unwrap();
        assert_eq!(OperatorKind::Filter, op.kind);
        assert_eq!(Some("f"), op.code.as_deref());
        dag.validate().unwrap();
    }
}
