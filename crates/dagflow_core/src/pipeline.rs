//! Splitting a plan into pipelines.
//!
//! A pipeline is a maximal chain of operators that can be fused into a single
//! open/next/close unit. A flow is fused when its producer isn't a pipeline
//! breaker and has exactly one consumer. Breakers terminate the pipeline of
//! their inputs and drive it to completion inside their own `open`.

use std::collections::BTreeMap;
use std::fmt;

use dagflow_error::{DbError, Result};

use crate::plan::dag::Dag;
use crate::plan::operator::OperatorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub usize);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSegment {
    pub id: PipelineId,
    /// Member operators in dependency order.
    pub operators: Vec<OperatorId>,
    /// Operator whose output leaves the pipeline.
    pub terminal: OperatorId,
    /// Set if the terminal is a breaker pulling this pipeline to completion.
    pub driver: Option<OperatorId>,
    /// Pipelines producing input for this one.
    pub upstream: Vec<PipelineId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineGraph {
    /// Pipelines in dependency order.
    pub pipelines: Vec<PipelineSegment>,
    /// Pipelines of nested plans, keyed by the owning operator.
    pub nested: BTreeMap<OperatorId, PipelineGraph>,
}

impl PipelineGraph {
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn pipeline_of(&self, op: OperatorId) -> Option<&PipelineSegment> {
        self.pipelines.iter().find(|p| p.operators.contains(&op))
    }

    fn fmt_indent(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        for p in &self.pipelines {
            let ops: Vec<_> = p.operators.iter().map(|o| o.to_string()).collect();
            write!(f, "{:indent$}{}: {}", "", p.id, ops.join(" -> "), indent = indent)?;
            if let Some(driver) = p.driver {
                write!(f, " (driver {driver})")?;
            }
            if !p.upstream.is_empty() {
                let up: Vec<_> = p.upstream.iter().map(|u| u.to_string()).collect();
                write!(f, " <- {}", up.join(", "))?;
            }
            writeln!(f)?;

            for op in &p.operators {
                if let Some(nested) = self.nested.get(op) {
                    nested.fmt_indent(f, indent + 2)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indent(f, 0)
    }
}

/// Union-find over operator indices.
struct Components {
    parent: Vec<usize>,
}

impl Components {
    fn new(n: usize) -> Self {
        Components {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.parent[idx] != idx {
            self.parent[idx] = self.parent[self.parent[idx]];
            idx = self.parent[idx];
        }
        idx
    }

    fn union(&mut self, a: usize, b: usize) {
        let a = self.find(a);
        let b = self.find(b);
        if a != b {
            self.parent[a] = b;
        }
    }
}

/// Partition a plan (and every nested plan) into pipelines.
pub fn partition_pipelines(dag: &Dag) -> Result<PipelineGraph> {
    let order = dag.topological_order()?;
    let position: BTreeMap<OperatorId, usize> =
        order.iter().enumerate().map(|(idx, id)| (*id, idx)).collect();

    let mut components = Components::new(order.len());
    let mut fused = vec![false; dag.flows().len()];

    for (flow_idx, flow) in dag.flows().iter().enumerate() {
        let producer = dag.operator(flow.source.operator)?;
        if producer.kind.is_pipeline_breaker() {
            continue;
        }
        if dag.consumers(producer.id).len() != 1 {
            continue;
        }
        fused[flow_idx] = true;
        components.union(
            position[&flow.source.operator],
            position[&flow.target.operator],
        );
    }

    // Group members by component root, keeping dependency order.
    let mut members: BTreeMap<usize, Vec<OperatorId>> = BTreeMap::new();
    for (idx, id) in order.iter().enumerate() {
        members.entry(components.find(idx)).or_default().push(*id);
    }

    // Order pipelines by the position of their terminal.
    let mut groups: Vec<Vec<OperatorId>> = members.into_values().collect();
    groups.sort_by_key(|ops| ops.last().map(|id| position[id]));

    let mut pipeline_of: BTreeMap<OperatorId, PipelineId> = BTreeMap::new();
    for (idx, ops) in groups.iter().enumerate() {
        for op in ops {
            pipeline_of.insert(*op, PipelineId(idx));
        }
    }

    let mut graph = PipelineGraph::default();
    for (idx, operators) in groups.into_iter().enumerate() {
        let id = PipelineId(idx);
        // Members are in dependency order and the terminal depends on every
        // other member, so it comes last.
        let terminal = *operators
            .last()
            .ok_or_else(|| DbError::new("Empty pipeline component"))?;
        let terminal_op = dag.operator(terminal)?;
        let driver = terminal_op
            .kind
            .is_pipeline_breaker()
            .then_some(terminal);

        let mut upstream: Vec<PipelineId> = dag
            .flows()
            .iter()
            .zip(&fused)
            .filter(|(flow, fused)| !**fused && operators.contains(&flow.target.operator))
            .map(|(flow, _)| pipeline_of[&flow.source.operator])
            .collect();
        upstream.sort();
        upstream.dedup();

        tracing::debug!(
            %id,
            operators = ?operators,
            %terminal,
            driver = ?driver,
            upstream = ?upstream,
            "partitioned pipeline"
        );

        graph.pipelines.push(PipelineSegment {
            id,
            operators,
            terminal,
            driver,
            upstream,
        });
    }

    for op in dag.operators() {
        if let Some(nested) = op.kind.nested() {
            graph.nested.insert(op.id, partition_pipelines(nested)?);
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::TupleSchema;
    use crate::plan::kind::{
        JoinParams, KeyParams, OperatorKind, PartitionParams, PipelineParams, RangeParams,
    };
    use crate::plan::operator::DagOperator;

    fn add(dag: &mut Dag, kind: OperatorKind) -> OperatorId {
        let mut op = DagOperator::new(kind, TupleSchema::default());
        if op.kind.requires_code() {
            op = op.with_code("f");
        }
        dag.add_operator(op).unwrap()
    }

    fn range(dag: &mut Dag) -> OperatorId {
        add(dag, OperatorKind::RangeSource(RangeParams { from: 0, to: 8, step: 1 }))
    }

    #[test]
    fn linear_chain_single_pipeline() {
        let mut dag = Dag::new();
        let src = range(&mut dag);
        let map = add(&mut dag, OperatorKind::Map);
        let filter = add(&mut dag, OperatorKind::Filter);
        dag.connect(src, 0, map, 0).unwrap();
        dag.connect(map, 0, filter, 0).unwrap();

        let graph = partition_pipelines(&dag).unwrap();
        assert_eq!(1, graph.len());
        assert_eq!(vec![src, map, filter], graph.pipelines[0].operators);
        assert_eq!(None, graph.pipelines[0].driver);
    }

    #[test]
    fn breaker_splits_pipelines() {
        let mut dag = Dag::new();
        let src = range(&mut dag);
        let map = add(&mut dag, OperatorKind::Map);
        let group = add(&mut dag, OperatorKind::GroupBy(KeyParams { num_keys: 1 }));
        let filter = add(&mut dag, OperatorKind::Filter);
        dag.connect(src, 0, map, 0).unwrap();
        dag.connect(map, 0, group, 0).unwrap();
        dag.connect(group, 0, filter, 0).unwrap();

        let graph = partition_pipelines(&dag).unwrap();
        assert_eq!(2, graph.len());

        let first = &graph.pipelines[0];
        assert_eq!(vec![src, map, group], first.operators);
        assert_eq!(Some(group), first.driver);

        let second = &graph.pipelines[1];
        assert_eq!(vec![filter], second.operators);
        assert_eq!(vec![first.id], second.upstream);
    }

    #[test]
    fn join_fuses_both_sides() {
        let mut dag = Dag::new();
        let left = range(&mut dag);
        let right = range(&mut dag);
        let join = add(&mut dag, OperatorKind::Join(JoinParams { num_keys: 1 }));
        dag.connect(left, 0, join, 0).unwrap();
        dag.connect(right, 0, join, 1).unwrap();

        let graph = partition_pipelines(&dag).unwrap();
        assert_eq!(1, graph.len());
        assert_eq!(join, graph.pipelines[0].terminal);
    }

    #[test]
    fn shared_producer_terminates_pipeline() {
        let mut dag = Dag::new();
        let src = range(&mut dag);
        let m1 = add(&mut dag, OperatorKind::Map);
        let m2 = add(&mut dag, OperatorKind::Map);
        let join = add(&mut dag, OperatorKind::Join(JoinParams { num_keys: 1 }));
        dag.connect(src, 0, m1, 0).unwrap();
        dag.connect(src, 0, m2, 0).unwrap();
        dag.connect(m1, 0, join, 0).unwrap();
        dag.connect(m2, 0, join, 1).unwrap();

        let graph = partition_pipelines(&dag).unwrap();
        assert_eq!(2, graph.len());
        assert_eq!(vec![src], graph.pipelines[0].operators);
        assert_eq!(vec![m1, m2, join], graph.pipelines[1].operators);
    }

    #[test]
    fn every_operator_in_exactly_one_pipeline() {
        let mut dag = Dag::new();
        let src = range(&mut dag);
        let fanout = add(
            &mut dag,
            OperatorKind::ConstantTuple(crate::plan::kind::ConstantParams {
                value: crate::value::Value::int64(2),
            }),
        );
        let part = add(
            &mut dag,
            OperatorKind::Partition(PartitionParams {
                seed: None,
                policy: None,
            }),
        );
        let mat = add(&mut dag, OperatorKind::MaterializeRowVector);
        let scan = add(&mut dag, OperatorKind::RowScan);
        let reduce = add(&mut dag, OperatorKind::Reduce);
        dag.connect(src, 0, part, 0).unwrap();
        dag.connect(fanout, 0, part, 1).unwrap();
        dag.connect(part, 0, mat, 0).unwrap();
        dag.connect(mat, 0, scan, 0).unwrap();
        dag.connect(scan, 0, reduce, 0).unwrap();

        let graph = partition_pipelines(&dag).unwrap();
        for op in dag.operators() {
            let count = graph
                .pipelines
                .iter()
                .filter(|p| p.operators.contains(&op.id))
                .count();
            assert_eq!(1, count, "{}", op.id);
        }
        assert_eq!(2, graph.len());
        assert_eq!(Some(mat), graph.pipelines[0].driver);
        assert_eq!(Some(reduce), graph.pipelines[1].driver);
    }

    #[test]
    fn nested_plans_partitioned() {
        let mut inner = Dag::new();
        let src = range(&mut inner);
        let map = add(&mut inner, OperatorKind::Map);
        inner.connect(src, 0, map, 0).unwrap();

        let mut dag = Dag::new();
        let pipeline = add(
            &mut dag,
            OperatorKind::Pipeline(PipelineParams {
                inner: Box::new(inner),
                num_inputs: 0,
            }),
        );

        let graph = partition_pipelines(&dag).unwrap();
        assert_eq!(1, graph.nested[&pipeline].len());
        let rendered = graph.to_string();
        assert!(rendered.contains("pipeline0: op0"), "{rendered}");
        assert!(rendered.contains("  pipeline0: op0 -> op1"), "{rendered}");
    }
}
