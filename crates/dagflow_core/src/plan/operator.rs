use std::collections::BTreeSet;
use std::fmt;

use super::kind::OperatorKind;
use crate::column::{AttributeId, TupleSchema};

/// Id of an operator, stable across rewrites. Unique within a single DAG,
/// nested DAGs have their own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(pub u32);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// A single plan node.
#[derive(Debug, Clone, PartialEq)]
pub struct DagOperator {
    pub id: OperatorId,
    pub kind: OperatorKind,
    /// Schema of the tuples produced on the output port.
    pub output: TupleSchema,
    pub read_set: BTreeSet<AttributeId>,
    pub write_set: BTreeSet<AttributeId>,
    /// Embedded expression body.
    pub code: Option<String>,
}

impl DagOperator {
    /// Create a new operator. The id is assigned when it's added to a DAG.
    pub fn new(kind: OperatorKind, output: TupleSchema) -> Self {
        DagOperator {
            id: OperatorId(0),
            kind,
            output,
            read_set: BTreeSet::new(),
            write_set: BTreeSet::new(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_read_set(mut self, attrs: impl IntoIterator<Item = AttributeId>) -> Self {
        self.read_set = attrs.into_iter().collect();
        self
    }

    pub fn with_write_set(mut self, attrs: impl IntoIterator<Item = AttributeId>) -> Self {
        self.write_set = attrs.into_iter().collect();
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.tag().as_str()
    }

    pub fn num_inputs(&self) -> usize {
        self.kind.num_inputs()
    }

    pub fn num_outputs(&self) -> usize {
        self.kind.num_outputs()
    }
}
