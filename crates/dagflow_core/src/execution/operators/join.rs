//! Hash join family.
//!
//! All joins build a hash table from one input inside `open` and probe it
//! lazily with the other. A second `open` without a `close` keeps the table
//! and restarts the probe side.

use std::fmt;

use dagflow_error::{DbError, Result};

use crate::execution::key::{KeyMap, KeySet, key_of, new_key_map, new_key_set, split_key};
use crate::execution::util::{RestartableInput, drain_with, into_fields};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::functions::AntiJoinPredicateFn;
use crate::value::Value;

fn not_built() -> DbError {
    DbError::protocol("Join probed before its build side was built")
}

/// Right tuple being matched against the build side.
#[derive(Debug)]
struct PendingProbe {
    key: Value,
    right_rest: Vec<Value>,
    next_match: usize,
}

/// Inner equi-join on the leading `num_keys` fields.
///
/// The left input (port 0) is the build side. Output tuples are the key
/// fields, followed by the left fields, followed by the right fields. Every
/// left tuple matching a key is emitted for every right tuple with that key.
#[derive(Debug)]
pub struct PhysicalHashJoin {
    left: BoxedOperator,
    right: RestartableInput,
    num_keys: usize,
    table: Option<KeyMap<Vec<Vec<Value>>>>,
    pending: Option<PendingProbe>,
    depth: usize,
}

impl PhysicalHashJoin {
    pub fn new(left: BoxedOperator, right: BoxedOperator, num_keys: usize) -> Self {
        PhysicalHashJoin {
            left,
            right: RestartableInput::new(right),
            num_keys,
            table: None,
            pending: None,
            depth: 0,
        }
    }
}

impl Operator for PhysicalHashJoin {
    fn name(&self) -> &'static str {
        "join"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.depth > 0 {
            self.right.restart(ctx)?;
            self.pending = None;
            self.depth += 1;
            return Ok(());
        }

        let num_keys = self.num_keys;
        let mut table: KeyMap<Vec<Vec<Value>>> = new_key_map();
        drain_with(&mut self.left, ctx, |row| {
            let (key, rest) = split_key(row, num_keys)?;
            table.entry(key).or_default().push(rest);
            Ok(())
        })?;
        tracing::debug!(keys = table.len(), "built join table");

        self.right.open(ctx)?;
        self.table = Some(table);
        self.pending = None;
        self.depth = 1;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let table = self.table.as_ref().ok_or_else(not_built)?;
        loop {
            if let Some(pending) = self.pending.as_mut() {
                let matches = table.get(&pending.key).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(left_rest) = matches.get(pending.next_match) {
                    pending.next_match += 1;
                    let mut fields = into_fields(pending.key.clone());
                    fields.extend(left_rest.iter().cloned());
                    fields.extend(pending.right_rest.iter().cloned());
                    return Ok(Some(Value::Tuple(fields)));
                }
                self.pending = None;
            }

            let Some(row) = self.right.next()? else {
                return Ok(None);
            };
            let (key, right_rest) = split_key(row, self.num_keys)?;
            if table.contains_key(&key) {
                self.pending = Some(PendingProbe {
                    key,
                    right_rest,
                    next_match: 0,
                });
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(DbError::protocol("Join closed without being opened"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        self.table = None;
        self.pending = None;
        self.right.close()
    }
}

/// Emits left tuples whose key appears in the right input.
///
/// The right input (port 1) is the build side. Left tuples pass through
/// unchanged and at most once.
#[derive(Debug)]
pub struct PhysicalSemiJoin {
    left: RestartableInput,
    right: BoxedOperator,
    num_keys: usize,
    keys: Option<KeySet>,
    depth: usize,
}

impl PhysicalSemiJoin {
    pub fn new(left: BoxedOperator, right: BoxedOperator, num_keys: usize) -> Self {
        PhysicalSemiJoin {
            left: RestartableInput::new(left),
            right,
            num_keys,
            keys: None,
            depth: 0,
        }
    }
}

impl Operator for PhysicalSemiJoin {
    fn name(&self) -> &'static str {
        "semi_join"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.depth > 0 {
            self.left.restart(ctx)?;
            self.depth += 1;
            return Ok(());
        }

        let num_keys = self.num_keys;
        let mut keys = new_key_set();
        drain_with(&mut self.right, ctx, |row| {
            keys.insert(key_of(&row, num_keys)?);
            Ok(())
        })?;

        self.left.open(ctx)?;
        self.keys = Some(keys);
        self.depth = 1;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let keys = self.keys.as_ref().ok_or_else(not_built)?;
        while let Some(row) = self.left.next()? {
            if keys.contains(&key_of(&row, self.num_keys)?) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(DbError::protocol("Semi join closed without being opened"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        self.keys = None;
        self.left.close()
    }
}

/// Emits left tuples with no matching right tuple.
///
/// A left tuple passes if its key is absent from the right input, or if the
/// predicate is false for every right tuple sharing the key.
pub struct PhysicalAntiJoin {
    left: RestartableInput,
    right: BoxedOperator,
    num_keys: usize,
    predicate: AntiJoinPredicateFn,
    table: Option<KeyMap<Vec<Value>>>,
    depth: usize,
}

impl fmt::Debug for PhysicalAntiJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalAntiJoin")
            .field("left", &self.left)
            .field("right", &self.right)
            .field("num_keys", &self.num_keys)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl PhysicalAntiJoin {
    pub fn new(
        left: BoxedOperator,
        right: BoxedOperator,
        num_keys: usize,
        predicate: AntiJoinPredicateFn,
    ) -> Self {
        PhysicalAntiJoin {
            left: RestartableInput::new(left),
            right,
            num_keys,
            predicate,
            table: None,
            depth: 0,
        }
    }
}

/// If a left tuple survives the anti join.
fn anti_join_passes(
    predicate: &AntiJoinPredicateFn,
    num_keys: usize,
    table: &KeyMap<Vec<Value>>,
    row: &Value,
) -> Result<bool> {
    let Some(matches) = table.get(&key_of(row, num_keys)?) else {
        return Ok(true);
    };
    for right in matches {
        if predicate(row, right)? {
            return Ok(false);
        }
    }
    Ok(true)
}

impl Operator for PhysicalAntiJoin {
    fn name(&self) -> &'static str {
        "anti_join"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.depth > 0 {
            self.left.restart(ctx)?;
            self.depth += 1;
            return Ok(());
        }

        let num_keys = self.num_keys;
        let mut table: KeyMap<Vec<Value>> = new_key_map();
        drain_with(&mut self.right, ctx, |row| {
            table.entry(key_of(&row, num_keys)?).or_default().push(row);
            Ok(())
        })?;

        self.left.open(ctx)?;
        self.table = Some(table);
        self.depth = 1;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let table = self.table.as_ref().ok_or_else(not_built)?;
        while let Some(row) = self.left.next()? {
            if anti_join_passes(&self.predicate, self.num_keys, table, &row)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(DbError::protocol("Anti join closed without being opened"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        self.table = None;
        self.left.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testutil::{VecSource, collect_all, test_context};

    fn rows(rows: &[(i64, &str)]) -> VecSource {
        VecSource::new(
            rows.iter()
                .map(|(k, s)| Value::tuple([Value::int64(*k), Value::utf8(*s)]))
                .collect(),
        )
    }

    fn row3(k: i64, l: &str, r: &str) -> Value {
        Value::tuple([Value::int64(k), Value::utf8(l), Value::utf8(r)])
    }

    #[test]
    fn join_matches_on_key() {
        let ctx = test_context();
        let left = rows(&[(1, "a"), (1, "b"), (2, "c")]);
        let right = rows(&[(1, "x"), (3, "y")]);
        let mut join = PhysicalHashJoin::new(left.boxed(), right.boxed(), 1);

        let out = collect_all(&mut join, &ctx).unwrap();
        assert_eq!(vec![row3(1, "a", "x"), row3(1, "b", "x")], out);
    }

    #[test]
    fn join_duplicates_on_both_sides() {
        let ctx = test_context();
        let left = rows(&[(1, "a"), (1, "b")]);
        let right = rows(&[(1, "x"), (1, "y")]);
        let mut join = PhysicalHashJoin::new(left.boxed(), right.boxed(), 1);

        let out = collect_all(&mut join, &ctx).unwrap();
        assert_eq!(
            vec![
                row3(1, "a", "x"),
                row3(1, "b", "x"),
                row3(1, "a", "y"),
                row3(1, "b", "y"),
            ],
            out
        );
    }

    #[test]
    fn reopen_reuses_build_side() {
        let ctx = test_context();
        let left = rows(&[(1, "a"), (2, "b")]);
        let right = rows(&[(2, "x"), (1, "y")]);
        let left_counts = left.counts();
        let right_counts = right.counts();
        let mut join = PhysicalHashJoin::new(left.boxed(), right.boxed(), 1);

        join.open(&ctx).unwrap();
        let mut first = Vec::new();
        while let Some(v) = join.next().unwrap() {
            first.push(v);
        }

        join.open(&ctx).unwrap();
        let mut second = Vec::new();
        while let Some(v) = join.next().unwrap() {
            second.push(v);
        }
        join.close().unwrap();
        join.close().unwrap();

        assert_eq!(first, second);
        assert_eq!(1, left_counts.opens());
        assert_eq!(1, left_counts.closes());
        assert_eq!(2, right_counts.opens());
        assert_eq!(2, right_counts.closes());
    }

    #[test]
    fn failed_probe_restart_closes_probe_once() {
        let ctx = test_context();
        let right = rows(&[(1, "x")]).failing_open_at(2);
        let right_counts = right.counts();
        let mut join = PhysicalHashJoin::new(rows(&[(1, "a")]).boxed(), right.boxed(), 1);

        join.open(&ctx).unwrap();
        join.open(&ctx).unwrap_err();
        join.next().unwrap_err();
        join.close().unwrap();
        assert_eq!(1, right_counts.opens());
        assert_eq!(1, right_counts.closes());

        let left = rows(&[(1, "a")]).failing_open_at(2);
        let left_counts = left.counts();
        let mut semi = PhysicalSemiJoin::new(left.boxed(), rows(&[(1, "x")]).boxed(), 1);

        semi.open(&ctx).unwrap();
        semi.open(&ctx).unwrap_err();
        semi.close().unwrap();
        assert_eq!(1, left_counts.opens());
        assert_eq!(1, left_counts.closes());
    }

    #[test]
    fn semi_join_no_duplication() {
        let ctx = test_context();
        let left = rows(&[(1, "a"), (2, "b"), (3, "c")]);
        let right = rows(&[(1, "x"), (1, "y"), (3, "z")]);
        let mut semi = PhysicalSemiJoin::new(left.boxed(), right.boxed(), 1);

        let out = collect_all(&mut semi, &ctx).unwrap();
        assert_eq!(
            vec![
                Value::tuple([Value::int64(1), Value::utf8("a")]),
                Value::tuple([Value::int64(3), Value::utf8("c")]),
            ],
            out
        );
    }

    fn same_payload(left: &Value, right: &Value) -> Result<bool> {
        Ok(left.field(1)? == right.field(1)?)
    }

    #[test]
    fn anti_join_with_predicate() {
        let ctx = test_context();
        let left = rows(&[(1, "a"), (2, "b"), (3, "c")]);
        // Key 1 matches but the predicate is false, key 2 matches with a true
        // predicate, key 3 is absent.
        let right = rows(&[(1, "x"), (2, "b"), (2, "q")]);
        let mut anti = PhysicalAntiJoin::new(left.boxed(), right.boxed(), 1, Arc::new(same_payload));

        let out = collect_all(&mut anti, &ctx).unwrap();
        assert_eq!(
            vec![
                Value::tuple([Value::int64(1), Value::utf8("a")]),
                Value::tuple([Value::int64(3), Value::utf8("c")]),
            ],
            out
        );
    }

    #[test]
    fn probe_error_propagates() {
        let ctx = test_context();
        let left = rows(&[(1, "a")]);
        let right = VecSource::new(vec![Value::int64(1)]);
        let mut join = PhysicalHashJoin::new(left.boxed(), right.boxed(), 1);
        join.open(&ctx).unwrap();
        join.next().unwrap_err();
        join.close().unwrap();
    }
}
