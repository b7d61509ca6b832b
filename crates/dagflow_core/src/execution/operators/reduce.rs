//! Reductions: by key, by grouped key, by dense index, and global.

use std::collections::BTreeMap;
use std::fmt;

use dagflow_error::{DbError, Result};

use crate::execution::key::{KeyMap, KeySet, new_key_map, new_key_set, split_key};
use crate::execution::util::{drain_with, into_fields};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::functions::ReduceFn;
use crate::value::Value;

/// Key fields followed by the fields of the reduced value.
fn keyed_output(key: Value, reduced: Value) -> Value {
    let mut fields = into_fields(key);
    fields.extend(into_fields(reduced));
    Value::Tuple(fields)
}

fn not_opened(name: &'static str) -> DbError {
    DbError::protocol("Reduction pulled before open").with_field("operator", name)
}

/// Reduces all tuples sharing a key with an associative and commutative
/// function.
///
/// The reducer sees the non-key fields as a tuple. The first tuple for a key
/// is kept as is, later ones are merged into it. Results are kept across a
/// second `open` without a `close`.
pub struct PhysicalReduceByKey {
    input: BoxedOperator,
    num_keys: usize,
    reducer: ReduceFn,
    results: Option<Vec<Value>>,
    cursor: usize,
    depth: usize,
}

impl fmt::Debug for PhysicalReduceByKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalReduceByKey")
            .field("input", &self.input)
            .field("num_keys", &self.num_keys)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl PhysicalReduceByKey {
    pub fn new(input: BoxedOperator, num_keys: usize, reducer: ReduceFn) -> Self {
        PhysicalReduceByKey {
            input,
            num_keys,
            reducer,
            results: None,
            cursor: 0,
            depth: 0,
        }
    }
}

impl Operator for PhysicalReduceByKey {
    fn name(&self) -> &'static str {
        "reduce_by_key"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.cursor = 0;
        if self.depth > 0 {
            self.depth += 1;
            return Ok(());
        }

        let num_keys = self.num_keys;
        let reducer = &self.reducer;
        let mut map: KeyMap<Value> = new_key_map();
        drain_with(&mut self.input, ctx, |row| {
            let (key, rest) = split_key(row, num_keys)?;
            let rest = Value::Tuple(rest);
            match map.get_mut(&key) {
                Some(acc) => {
                    let prev = std::mem::replace(acc, Value::None);
                    *acc = reducer(prev, &rest)?;
                }
                None => {
                    map.insert(key, rest);
                }
            }
            Ok(())
        })?;

        self.results = Some(
            map.into_iter()
                .map(|(key, reduced)| keyed_output(key, reduced))
                .collect(),
        );
        self.depth = 1;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let results = self
            .results
            .as_ref()
            .ok_or_else(|| not_opened(self.name()))?;
        let out = results.get(self.cursor).cloned();
        if out.is_some() {
            self.cursor += 1;
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(DbError::protocol("Reduce by key closed without being opened"));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.results = None;
        }
        Ok(())
    }
}

/// Streaming reduction over input already grouped by key.
///
/// Emits a key's result as soon as the key changes. The grouping is trusted
/// unless `check_grouped` is set, in which case a key showing up again after
/// its group ended is a protocol violation.
pub struct PhysicalReduceByKeyGrouped {
    input: BoxedOperator,
    num_keys: usize,
    reducer: ReduceFn,
    check_grouped: bool,
    current: Option<(Value, Value)>,
    finished_keys: Option<KeySet>,
    exhausted: bool,
}

impl fmt::Debug for PhysicalReduceByKeyGrouped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalReduceByKeyGrouped")
            .field("input", &self.input)
            .field("num_keys", &self.num_keys)
            .field("check_grouped", &self.check_grouped)
            .finish_non_exhaustive()
    }
}

impl PhysicalReduceByKeyGrouped {
    pub fn new(input: BoxedOperator, num_keys: usize, reducer: ReduceFn) -> Self {
        PhysicalReduceByKeyGrouped {
            input,
            num_keys,
            reducer,
            check_grouped: false,
            current: None,
            finished_keys: None,
            exhausted: false,
        }
    }

    fn finish_group(&mut self, key: Value, acc: Value) -> Value {
        if let Some(finished) = self.finished_keys.as_mut() {
            finished.insert(key.clone());
        }
        keyed_output(key, acc)
    }
}

impl Operator for PhysicalReduceByKeyGrouped {
    fn name(&self) -> &'static str {
        "reduce_by_key_grouped"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.check_grouped = ctx.config.check_grouped_input;
        self.input.open(ctx)?;
        self.current = None;
        self.exhausted = false;
        self.finished_keys = self.check_grouped.then(new_key_set);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let Some(row) = self.input.next()? else {
                self.exhausted = true;
                return Ok(self
                    .current
                    .take()
                    .map(|(key, acc)| self.finish_group(key, acc)));
            };
            let (key, rest) = split_key(row, self.num_keys)?;
            let rest = Value::Tuple(rest);

            match self.current.take() {
                Some((current_key, acc)) if current_key == key => {
                    self.current = Some((current_key, (self.reducer)(acc, &rest)?));
                }
                Some((current_key, acc)) => {
                    self.check_not_finished(&key)?;
                    let out = self.finish_group(current_key, acc);
                    self.current = Some((key, rest));
                    return Ok(Some(out));
                }
                None => {
                    self.check_not_finished(&key)?;
                    self.current = Some((key, rest));
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        self.finished_keys = None;
        self.input.close()
    }
}

impl PhysicalReduceByKeyGrouped {
    fn check_not_finished(&self, key: &Value) -> Result<()> {
        match &self.finished_keys {
            Some(finished) if finished.contains(key) => {
                Err(DbError::protocol("Input to grouped reduction is not grouped by key")
                    .with_field("key", key))
            }
            _ => Ok(()),
        }
    }
}

/// Widest index range reduced into a dense vector. Wider ranges use an
/// ordered map holding only the indices seen.
pub const MAX_DENSE_INDEX_WIDTH: u64 = 1 << 20;

/// Accumulators for `ReduceByIndex`, addressed by offset from `min`.
#[derive(Debug)]
enum IndexSlots {
    Dense(Vec<Option<Value>>),
    Sparse(BTreeMap<u64, Value>),
}

impl IndexSlots {
    fn with_width(width: u64) -> Self {
        if width <= MAX_DENSE_INDEX_WIDTH {
            IndexSlots::Dense(vec![None; width as usize])
        } else {
            IndexSlots::Sparse(BTreeMap::new())
        }
    }

    fn merge(&mut self, offset: u64, value: Value, reducer: &ReduceFn) -> Result<()> {
        let prev = match self {
            IndexSlots::Dense(slots) => slots[offset as usize].take(),
            IndexSlots::Sparse(map) => map.remove(&offset),
        };
        let merged = match prev {
            Some(acc) => reducer(acc, &value)?,
            None => value,
        };
        match self {
            IndexSlots::Dense(slots) => slots[offset as usize] = Some(merged),
            IndexSlots::Sparse(map) => {
                map.insert(offset, merged);
            }
        }
        Ok(())
    }

    /// Occupied slots in ascending offset order.
    fn into_sorted(self) -> Vec<(u64, Value)> {
        match self {
            IndexSlots::Dense(slots) => slots
                .into_iter()
                .enumerate()
                .filter_map(|(offset, v)| v.map(|v| (offset as u64, v)))
                .collect(),
            IndexSlots::Sparse(map) => map.into_iter().collect(),
        }
    }
}

/// Reduction keyed by an integer in `[min, max]`.
///
/// Narrow ranges are backed by a dense vector. Only indices that saw at least
/// one tuple are emitted, in ascending order.
pub struct PhysicalReduceByIndex {
    input: BoxedOperator,
    min: i64,
    max: i64,
    reducer: ReduceFn,
    results: std::vec::IntoIter<(u64, Value)>,
}

impl fmt::Debug for PhysicalReduceByIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalReduceByIndex")
            .field("input", &self.input)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl PhysicalReduceByIndex {
    pub fn new(input: BoxedOperator, min: i64, max: i64, reducer: ReduceFn) -> Self {
        PhysicalReduceByIndex {
            input,
            min,
            max,
            reducer,
            results: Vec::new().into_iter(),
        }
    }
}

impl Operator for PhysicalReduceByIndex {
    fn name(&self) -> &'static str {
        "reduce_by_index"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let (min, max) = (self.min, self.max);
        if min > max {
            return Err(DbError::plan("Invalid index range")
                .with_field("min", min)
                .with_field("max", max));
        }
        // Fits in u64 for any pair of i64 bounds.
        let span = max.abs_diff(min);
        let mut slots = IndexSlots::with_width(span.saturating_add(1));
        let reducer = &self.reducer;

        drain_with(&mut self.input, ctx, |row| {
            let (key, rest) = split_key(row, 1)?;
            let idx = key.field(0)?.try_as_i64()?;
            if idx < min || idx > max {
                return Err(DbError::protocol("Index outside of reduction range")
                    .with_field("index", idx)
                    .with_field("min", min)
                    .with_field("max", max));
            }
            slots.merge(idx.abs_diff(min), Value::Tuple(rest), reducer)
        })?;

        self.results = slots.into_sorted().into_iter();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let Some((offset, reduced)) = self.results.next() else {
            return Ok(None);
        };
        let key = self.min.checked_add_unsigned(offset).ok_or_else(|| {
            DbError::new("Reduction index overflow").with_field("offset", offset)
        })?;
        Ok(Some(keyed_output(Value::int64(key), reduced)))
    }

    fn close(&mut self) -> Result<()> {
        self.results = Vec::new().into_iter();
        Ok(())
    }
}

/// Left fold over the whole input, seeded with the first tuple.
pub struct PhysicalReduce {
    input: BoxedOperator,
    reducer: ReduceFn,
    result: Option<Value>,
}

impl fmt::Debug for PhysicalReduce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalReduce")
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl PhysicalReduce {
    pub fn new(input: BoxedOperator, reducer: ReduceFn) -> Self {
        PhysicalReduce {
            input,
            reducer,
            result: None,
        }
    }
}

impl Operator for PhysicalReduce {
    fn name(&self) -> &'static str {
        "reduce"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let reducer = &self.reducer;
        let mut acc: Option<Value> = None;
        drain_with(&mut self.input, ctx, |row| {
            acc = Some(match acc.take() {
                Some(prev) => reducer(prev, &row)?,
                None => row,
            });
            Ok(())
        })?;

        self.result = Some(acc.ok_or_else(|| DbError::protocol("Reduce over empty input"))?);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.result.take())
    }

    fn close(&mut self) -> Result<()> {
        self.result = None;
        Ok(())
    }
}
