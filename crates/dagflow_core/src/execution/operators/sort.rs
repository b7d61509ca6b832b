use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use dagflow_error::Result;

use crate::execution::util::drain_with;
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::value::Value;

/// Fully materializes the input and emits it sorted ascending by one field.
///
/// The sort is stable.
#[derive(Debug)]
pub struct PhysicalSort {
    input: BoxedOperator,
    key_column: usize,
    sorted: VecDeque<Value>,
}

impl PhysicalSort {
    pub fn new(input: BoxedOperator, key_column: usize) -> Self {
        PhysicalSort {
            input,
            key_column,
            sorted: VecDeque::new(),
        }
    }
}

impl Operator for PhysicalSort {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let key_column = self.key_column;
        let mut rows: Vec<(Value, Value)> = Vec::new();
        drain_with(&mut self.input, ctx, |row| {
            rows.push((row.field(key_column)?.clone(), row));
            Ok(())
        })?;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        self.sorted = rows.into_iter().map(|(_, row)| row).collect();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.sorted.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.sorted.clear();
        Ok(())
    }
}

/// Candidate for the top k.
///
/// Ordered by key, then by arrival with earlier tuples ranking higher, so the
/// minimum of the heap is the tuple to displace.
#[derive(Debug)]
struct Candidate {
    key: Value,
    seq: usize,
    row: Value,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Keeps the `n` tuples with the largest key and emits them in descending
/// key order. Ties keep the tuple that arrived first.
#[derive(Debug)]
pub struct PhysicalTopK {
    input: BoxedOperator,
    n: usize,
    key_column: usize,
    output: VecDeque<Value>,
}

impl PhysicalTopK {
    pub fn new(input: BoxedOperator, n: usize, key_column: usize) -> Self {
        PhysicalTopK {
            input,
            n,
            key_column,
            output: VecDeque::new(),
        }
    }
}

impl Operator for PhysicalTopK {
    fn name(&self) -> &'static str {
        "top_k"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let (n, key_column) = (self.n, self.key_column);
        // Min-heap over candidates.
        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(n);
        let mut seq = 0;

        drain_with(&mut self.input, ctx, |row| {
            let candidate = Candidate {
                key: row.field(key_column)?.clone(),
                seq,
                row,
            };
            seq += 1;

            if heap.len() < n {
                heap.push(Reverse(candidate));
            } else if let Some(mut min) = heap.peek_mut() {
                if candidate.key > min.0.key {
                    *min = Reverse(candidate);
                }
            }
            Ok(())
        })?;

        let mut best: Vec<Candidate> = heap.into_iter().map(|Reverse(c)| c).collect();
        best.sort_by(|a, b| b.cmp(a));
        self.output = best.into_iter().map(|c| c.row).collect();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.output.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.output.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::seq::SliceRandom;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::testutil::{VecSource, collect_all, leading_ints, test_context};

    #[test]
    fn sort_is_stable() {
        let ctx = test_context();
        let rows = vec![
            Value::tuple([Value::int64(2), Value::utf8("a")]),
            Value::tuple([Value::int64(1), Value::utf8("b")]),
            Value::tuple([Value::int64(2), Value::utf8("c")]),
            Value::tuple([Value::int64(0), Value::utf8("d")]),
        ];
        let mut op = PhysicalSort::new(VecSource::new(rows).boxed(), 0);
        let out = collect_all(&mut op, &ctx).unwrap();
        let payload: Vec<_> = out.iter().map(|r| r.field(1).unwrap().clone()).collect();
        assert_eq!(
            vec![
                Value::utf8("d"),
                Value::utf8("b"),
                Value::utf8("a"),
                Value::utf8("c")
            ],
            payload
        );
    }

    #[test]
    fn top_three() {
        let ctx = test_context();
        let mut op = PhysicalTopK::new(VecSource::ints([5, 1, 9, 3, 7, 2]).boxed(), 3, 0);
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![9, 7, 5], leading_ints(&out));
    }

    #[test]
    fn top_k_independent_of_input_order() {
        let ctx = test_context();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut input: Vec<i64> = (0..200).collect();
        for _ in 0..10 {
            input.shuffle(&mut rng);
            let mut op = PhysicalTopK::new(VecSource::ints(input.clone()).boxed(), 5, 0);
            let out = collect_all(&mut op, &ctx).unwrap();
            assert_eq!(vec![199, 198, 197, 196, 195], leading_ints(&out));
        }
    }

    #[test]
    fn ties_keep_first_arrival() {
        let ctx = test_context();
        let rows = vec![
            Value::tuple([Value::int64(1), Value::utf8("first")]),
            Value::tuple([Value::int64(1), Value::utf8("second")]),
            Value::tuple([Value::int64(0), Value::utf8("third")]),
        ];
        let mut op = PhysicalTopK::new(VecSource::new(rows).boxed(), 1, 0);
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![Value::tuple([Value::int64(1), Value::utf8("first")])], out);
    }

    #[test]
    fn fewer_rows_than_k() {
        let ctx = test_context();
        let mut op = PhysicalTopK::new(VecSource::ints([2, 4]).boxed(), 10, 0);
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![4, 2], leading_ints(&out));
    }
}
