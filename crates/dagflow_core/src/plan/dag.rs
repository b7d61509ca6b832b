use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt::Write as _;

use dagflow_error::{DbError, Result};

use super::operator::{DagOperator, OperatorId};
use crate::column::{AttributeId, ColumnArena};

/// One end of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    pub operator: OperatorId,
    pub port: usize,
}

/// Edge from an output port to an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    pub source: Port,
    pub target: Port,
}

/// Reference to an operator somewhere in a tree of DAGs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedOperator {
    /// Ids of the operators owning the nested DAGs, outermost first. Empty
    /// for the top level.
    pub path: Vec<OperatorId>,
    pub id: OperatorId,
}

/// A plan: operators plus the flows connecting them.
///
/// Operators that own a nested plan make the whole structure a tree of DAGs.
/// Each DAG owns the column arena its operators' schemas point into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    operators: BTreeMap<OperatorId, DagOperator>,
    flows: Vec<Flow>,
    pub columns: ColumnArena,
    next_id: u32,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(columns: ColumnArena) -> Self {
        Dag {
            columns,
            ..Default::default()
        }
    }

    /// Add an operator, assigning it a fresh id.
    pub fn add_operator(&mut self, mut op: DagOperator) -> Result<OperatorId> {
        op.kind.validate_params()?;
        let id = OperatorId(self.next_id);
        self.next_id += 1;
        op.id = id;
        self.operators.insert(id, op);
        Ok(id)
    }

    /// Add an operator keeping its existing id.
    pub fn insert_operator(&mut self, op: DagOperator) -> Result<()> {
        op.kind.validate_params()?;
        if self.operators.contains_key(&op.id) {
            return Err(DbError::plan("Duplicate operator id").with_field("id", op.id));
        }
        self.next_id = self.next_id.max(op.id.0 + 1);
        self.operators.insert(op.id, op);
        Ok(())
    }

    /// Connect an output port to an input port.
    pub fn connect(
        &mut self,
        source: OperatorId,
        source_port: usize,
        target: OperatorId,
        target_port: usize,
    ) -> Result<()> {
        let src = self.operator(source)?;
        if source_port >= src.num_outputs() {
            return Err(DbError::plan("Output port out of range")
                .with_field("operator", source)
                .with_field("port", source_port)
                .with_field("num_outputs", src.num_outputs()));
        }
        let dst = self.operator(target)?;
        if target_port >= dst.num_inputs() {
            return Err(DbError::plan("Input port out of range")
                .with_field("operator", target)
                .with_field("kind", dst.name())
                .with_field("port", target_port)
                .with_field("num_inputs", dst.num_inputs()));
        }

        let target = Port {
            operator: target,
            port: target_port,
        };
        if self.flows.iter().any(|f| f.target == target) {
            return Err(DbError::plan("Input port already connected")
                .with_field("operator", target.operator)
                .with_field("port", target_port));
        }

        self.flows.push(Flow {
            source: Port {
                operator: source,
                port: source_port,
            },
            target,
        });
        Ok(())
    }

    /// Replace an operator in place.
    ///
    /// The new operator takes over the old id, so every flow referencing the
    /// old operator now references the new one. The new operator may declare
    /// more inputs than the old one; the extra ports must be connected
    /// afterwards.
    pub fn replace_operator(&mut self, old: OperatorId, mut new: DagOperator) -> Result<()> {
        new.kind.validate_params()?;
        if !self.operators.contains_key(&old) {
            return Err(DbError::plan("Missing operator to replace").with_field("id", old));
        }

        for flow in &self.flows {
            if flow.target.operator == old && flow.target.port >= new.num_inputs() {
                return Err(DbError::plan("Replacement operator drops a connected input")
                    .with_field("id", old)
                    .with_field("port", flow.target.port)
                    .with_field("kind", new.name()));
            }
            if flow.source.operator == old && flow.source.port >= new.num_outputs() {
                return Err(DbError::plan("Replacement operator drops a connected output")
                    .with_field("id", old)
                    .with_field("port", flow.source.port));
            }
        }

        new.id = old;
        self.operators.insert(old, new);
        Ok(())
    }

    pub fn operator(&self, id: OperatorId) -> Result<&DagOperator> {
        self.operators
            .get(&id)
            .ok_or_else(|| DbError::plan("Missing operator").with_field("id", id))
    }

    pub fn operator_mut(&mut self, id: OperatorId) -> Result<&mut DagOperator> {
        self.operators
            .get_mut(&id)
            .ok_or_else(|| DbError::plan("Missing operator").with_field("id", id))
    }

    pub fn operators(&self) -> impl Iterator<Item = &DagOperator> {
        self.operators.values()
    }

    pub fn num_operators(&self) -> usize {
        self.operators.len()
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Get the operator feeding an input port.
    pub fn input(&self, id: OperatorId, port: usize) -> Result<OperatorId> {
        self.flows
            .iter()
            .find(|f| f.target.operator == id && f.target.port == port)
            .map(|f| f.source.operator)
            .ok_or_else(|| {
                DbError::plan("Input port not connected")
                    .with_field("operator", id)
                    .with_field("port", port)
            })
    }

    /// Operators feeding each input port, in port order.
    pub fn inputs(&self, id: OperatorId) -> Result<Vec<OperatorId>> {
        let op = self.operator(id)?;
        (0..op.num_inputs()).map(|port| self.input(id, port)).collect()
    }

    /// Ports consuming the output of an operator.
    pub fn consumers(&self, id: OperatorId) -> Vec<Port> {
        self.flows
            .iter()
            .filter(|f| f.source.operator == id)
            .map(|f| f.target)
            .collect()
    }

    pub fn sources(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.num_inputs() == 0)
            .map(|op| op.id)
            .collect()
    }

    /// The single operator whose output isn't consumed.
    pub fn sink(&self) -> Result<OperatorId> {
        let consumed: HashSet<_> = self.flows.iter().map(|f| f.source.operator).collect();
        let mut sinks = self.operators.keys().filter(|id| !consumed.contains(id));

        let sink = sinks.next().ok_or_else(|| DbError::plan("Plan has no sink"))?;
        if let Some(other) = sinks.next() {
            return Err(DbError::plan("Plan has more than one sink")
                .with_field("first", sink)
                .with_field("second", other));
        }
        Ok(*sink)
    }

    /// Operators of this DAG in dependency order.
    ///
    /// Ties are broken by id so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<OperatorId>> {
        let mut in_degree: BTreeMap<OperatorId, usize> =
            self.operators.keys().map(|id| (*id, 0)).collect();
        for flow in &self.flows {
            *in_degree.get_mut(&flow.target.operator).ok_or_else(|| {
                DbError::plan("Flow references missing operator")
                    .with_field("id", flow.target.operator)
            })? += 1;
        }

        let mut ready: BTreeSet<OperatorId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.operators.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for flow in self.flows.iter().filter(|f| f.source.operator == id) {
                let deg = in_degree.get_mut(&flow.target.operator).ok_or_else(|| {
                    DbError::plan("Flow references missing operator")
                        .with_field("id", flow.target.operator)
                })?;
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(flow.target.operator);
                }
            }
        }

        if order.len() != self.operators.len() {
            return Err(DbError::plan("Plan contains a cycle"));
        }

        Ok(order)
    }

    /// Dependency order across the whole tree of DAGs.
    ///
    /// Operators of a nested DAG are listed right before the operator owning
    /// it.
    pub fn topological_order_recursive(&self) -> Result<Vec<NestedOperator>> {
        let mut out = Vec::new();
        self.collect_recursive(&mut Vec::new(), &mut out)?;
        Ok(out)
    }

    fn collect_recursive(
        &self,
        path: &mut Vec<OperatorId>,
        out: &mut Vec<NestedOperator>,
    ) -> Result<()> {
        for id in self.topological_order()? {
            let op = self.operator(id)?;
            if let Some(nested) = op.kind.nested() {
                path.push(id);
                nested.collect_recursive(path, out)?;
                path.pop();
            }
            out.push(NestedOperator {
                path: path.clone(),
                id,
            });
        }
        Ok(())
    }

    /// Operators the sink transitively depends on, including the sink.
    pub fn reachable_from_sink(&self) -> Result<HashSet<OperatorId>> {
        let sink = self.sink()?;
        Ok(self.ancestors_inclusive(sink))
    }

    fn ancestors_inclusive(&self, id: OperatorId) -> HashSet<OperatorId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for flow in self.flows.iter().filter(|f| f.target.operator == id) {
                queue.push_back(flow.source.operator);
            }
        }
        seen
    }

    /// Check structural invariants of this DAG and every nested DAG.
    pub fn validate(&self) -> Result<()> {
        for flow in &self.flows {
            let src = self.operator(flow.source.operator)?;
            let dst = self.operator(flow.target.operator)?;
            if flow.source.port >= src.num_outputs() || flow.target.port >= dst.num_inputs() {
                return Err(DbError::plan("Flow port out of range")
                    .with_field("source", flow.source.operator)
                    .with_field("target", flow.target.operator));
            }
        }

        for op in self.operators.values() {
            for port in 0..op.num_inputs() {
                let count = self
                    .flows
                    .iter()
                    .filter(|f| f.target.operator == op.id && f.target.port == port)
                    .count();
                if count != 1 {
                    return Err(DbError::plan("Input port must be connected exactly once")
                        .with_field("operator", op.id)
                        .with_field("kind", op.name())
                        .with_field("port", port)
                        .with_field("connections", count));
                }
            }

            if op.kind.requires_code() && op.code.is_none() {
                return Err(DbError::plan("Operator requires an expression body")
                    .with_field("operator", op.id)
                    .with_field("kind", op.name()));
            }

            let num_attrs = self.columns.num_attributes() as u32;
            if let Some(attr) = op
                .read_set
                .iter()
                .chain(op.write_set.iter())
                .find(|a| a.0 >= num_attrs)
            {
                return Err(DbError::plan("Operator references unknown attribute")
                    .with_field("operator", op.id)
                    .with_field("attribute", attr));
            }

            for field in &op.output.fields {
                self.columns.field(*field).map_err(|_| {
                    DbError::plan("Operator output references unknown field")
                        .with_field("operator", op.id)
                        .with_field("field", field.0)
                })?;
            }

            if let Some(nested) = op.kind.nested() {
                nested.validate()?;
            }
        }

        self.sink()?;
        self.topological_order()?;

        Ok(())
    }

    /// Check that every attribute an operator reads is produced by one of its
    /// upstream operators.
    pub fn check_read_sets(&self) -> Result<()> {
        for op in self.operators.values() {
            if op.read_set.is_empty() {
                continue;
            }

            let mut available: HashSet<AttributeId> = HashSet::new();
            for ancestor in self.ancestors_inclusive(op.id) {
                if ancestor == op.id {
                    continue;
                }
                let ancestor = self.operator(ancestor)?;
                available.extend(ancestor.write_set.iter().copied());
                available.extend(self.columns.attributes_of(&ancestor.output)?);
            }

            if let Some(missing) = op.read_set.iter().find(|a| !available.contains(a)) {
                return Err(DbError::plan("Operator reads an attribute no upstream produces")
                    .with_field("operator", op.id)
                    .with_field("attribute", missing));
            }
        }
        Ok(())
    }

    /// Render the plan in dependency order, nested plans indented.
    pub fn explain(&self) -> Result<String> {
        let mut out = String::new();
        self.explain_indent(0, &mut out)?;
        Ok(out)
    }

    fn explain_indent(&self, indent: usize, out: &mut String) -> Result<()> {
        for id in self.topological_order()? {
            let op = self.operator(id)?;
            write!(out, "{:indent$}{} {}", "", id, op.name(), indent = indent)?;

            let params = op.kind.describe_params();
            if !params.is_empty() {
                write!(out, " [{params}]")?;
            }

            let inputs = self.inputs(id).unwrap_or_default();
            if !inputs.is_empty() {
                let inputs: Vec<_> = inputs.iter().map(|i| i.to_string()).collect();
                write!(out, " <- {}", inputs.join(", "))?;
            }
            if let Some(code) = &op.code {
                write!(out, " code={code:?}")?;
            }
            writeln!(out)?;

            if let Some(nested) = op.kind.nested() {
                nested.explain_indent(indent + 2, out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::TupleSchema;
    use crate::plan::kind::{JoinParams, OperatorKind, PipelineParams, RangeParams};

    fn range(dag: &mut Dag, to: i64) -> OperatorId {
        dag.add_operator(DagOperator::new(
            OperatorKind::RangeSource(RangeParams { from: 0, to, step: 1 }),
            TupleSchema::default(),
        ))
        .unwrap()
    }

    fn join_plan() -> (Dag, [OperatorId; 4]) {
        let mut dag = Dag::new();
        let a = range(&mut dag, 4);
        let b = range(&mut dag, 4);
        let join = dag
            .add_operator(DagOperator::new(
                OperatorKind::Join(JoinParams { num_keys: 1 }),
                TupleSchema::default(),
            ))
            .unwrap();
        let map = dag
            .add_operator(DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("id"))
            .unwrap();
        dag.connect(b, 0, join, 0).unwrap();
        dag.connect(a, 0, join, 1).unwrap();
        dag.connect(join, 0, map, 0).unwrap();
        (dag, [a, b, join, map])
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let (dag, [_, _, join, map]) = join_plan();
        let order = dag.topological_order().unwrap();
        assert_eq!(4, order.len());

        let pos = |id| order.iter().position(|o| *o == id).unwrap();
        for flow in dag.flows() {
            assert!(pos(flow.source.operator) < pos(flow.target.operator));
        }
        assert_eq!(map, *order.last().unwrap());
        assert!(pos(join) < pos(map));
    }

    #[test]
    fn connect_checks_arity() {
        let (mut dag, [a, _, join, map]) = join_plan();
        let err = dag.connect(a, 0, join, 2).unwrap_err();
        assert_eq!(dagflow_error::ErrorKind::PlanMalformed, err.kind());
        dag.connect(a, 1, map, 0).unwrap_err();
        // Already connected.
        dag.connect(a, 0, map, 0).unwrap_err();
    }

    #[test]
    fn validate_finds_unconnected_port() {
        let mut dag = Dag::new();
        let a = range(&mut dag, 4);
        let join = dag
            .add_operator(DagOperator::new(
                OperatorKind::Join(JoinParams { num_keys: 1 }),
                TupleSchema::default(),
            ))
            .unwrap();
        dag.connect(a, 0, join, 0).unwrap();

        let err = dag.validate().unwrap_err();
        assert_eq!(Some("1"), err.get_field("port"));
    }

    #[test]
    fn validate_requires_code() {
        let mut dag = Dag::new();
        let a = range(&mut dag, 4);
        let map = dag
            .add_operator(DagOperator::new(OperatorKind::Map, TupleSchema::default()))
            .unwrap();
        dag.connect(a, 0, map, 0).unwrap();
        dag.validate().unwrap_err();
    }

    #[test]
    fn multiple_sinks() {
        let mut dag = Dag::new();
        range(&mut dag, 1);
        range(&mut dag, 2);
        dag.sink().unwrap_err();
    }

    #[test]
    fn cycle_detected() {
        let mut dag = Dag::new();
        let m1 = dag
            .add_operator(DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("f"))
            .unwrap();
        let m2 = dag
            .add_operator(DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("f"))
            .unwrap();
        dag.connect(m1, 0, m2, 0).unwrap();
        dag.connect(m2, 0, m1, 0).unwrap();
        dag.topological_order().unwrap_err();
    }

    #[test]
    fn replace_preserves_id_and_flows() {
        let (mut dag, [_, _, join, map]) = join_plan();
        let new = DagOperator::new(
            OperatorKind::SemiJoin(JoinParams { num_keys: 1 }),
            TupleSchema::default(),
        );
        dag.replace_operator(join, new).unwrap();

        assert_eq!("semi_join", dag.operator(join).unwrap().name());
        assert_eq!(join, dag.operator(join).unwrap().id);
        assert_eq!(join, dag.input(map, 0).unwrap());
        dag.validate().unwrap();
    }

    #[test]
    fn replace_rejects_dropping_inputs() {
        let (mut dag, [_, _, join, _]) = join_plan();
        let new = DagOperator::new(OperatorKind::Map, TupleSchema::default()).with_code("f");
        dag.replace_operator(join, new).unwrap_err();
    }

    #[test]
    fn recursive_order_lists_nested_before_owner() {
        let mut inner = Dag::new();
        range(&mut inner, 3);

        let mut dag = Dag::new();
        let pipeline = dag
            .add_operator(DagOperator::new(
                OperatorKind::Pipeline(PipelineParams {
                    inner: Box::new(inner),
                    num_inputs: 0,
                }),
                TupleSchema::default(),
            ))
            .unwrap();

        let order = dag.topological_order_recursive().unwrap();
        assert_eq!(
            vec![
                NestedOperator {
                    path: vec![pipeline],
                    id: OperatorId(0),
                },
                NestedOperator {
                    path: vec![],
                    id: pipeline,
                },
            ],
            order
        );
    }

    #[test]
    fn explain_lists_inputs() {
        let (dag, _) = join_plan();
        let explain = dag.explain().unwrap();
        assert!(explain.contains("op2 join [num_keys=1] <- op1, op0"), "{explain}");
        assert!(explain.contains("op3 map <- op2 code=\"id\""), "{explain}");
    }
}
