use dagflow_error::{DbError, Result};

use crate::execution::key::{KeyMap, new_key_map, split_key};
use crate::execution::util::{drain_with, into_fields};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::value::{GrowableArray, Value};

/// Collects tuples by key.
///
/// Emits one tuple per group holding the key fields followed by an array of
/// the remaining fields of every member. Groups are emitted in hash map
/// iteration order, which is fixed for a given input.
///
/// Groups are kept across a second `open` without a `close`.
#[derive(Debug)]
pub struct PhysicalGroupBy {
    input: BoxedOperator,
    num_keys: usize,
    groups: Option<Vec<Value>>,
    cursor: usize,
    depth: usize,
}

impl PhysicalGroupBy {
    pub fn new(input: BoxedOperator, num_keys: usize) -> Self {
        PhysicalGroupBy {
            input,
            num_keys,
            groups: None,
            cursor: 0,
            depth: 0,
        }
    }
}

impl Operator for PhysicalGroupBy {
    fn name(&self) -> &'static str {
        "group_by"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.cursor = 0;
        if self.depth > 0 {
            self.depth += 1;
            return Ok(());
        }

        let num_keys = self.num_keys;
        let mut map: KeyMap<GrowableArray> = new_key_map();
        drain_with(&mut self.input, ctx, |row| {
            let (key, rest) = split_key(row, num_keys)?;
            map.entry(key).or_default().push(Value::Tuple(rest));
            Ok(())
        })?;
        tracing::debug!(groups = map.len(), "grouped input");

        let groups = map
            .into_iter()
            .map(|(key, members)| {
                let mut fields = into_fields(key);
                fields.push(Value::Array(members.into_array()));
                Value::Tuple(fields)
            })
            .collect();

        self.groups = Some(groups);
        self.depth = 1;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let groups = self
            .groups
            .as_ref()
            .ok_or_else(|| DbError::protocol("Group by pulled before open"))?;
        let out = groups.get(self.cursor).cloned();
        if out.is_some() {
            self.cursor += 1;
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(DbError::protocol("Group by closed without being opened"));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.groups = None;
        }
        Ok(())
    }
}
