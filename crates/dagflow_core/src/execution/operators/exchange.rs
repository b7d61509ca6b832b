//! Exchange of partitioned data between workers.

use std::collections::VecDeque;
use std::sync::Arc;

use dagflow_error::{DbError, Result, ResultExt};

use crate::execution::util::{drain_with, read_single_scalar};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::runtime::exchange::{ExchangeMessage, ExchangeTransport};
use crate::value::Value;
use crate::value::wire::WireCodec;

#[derive(Debug)]
struct Receiving {
    transport: Arc<dyn ExchangeTransport>,
    codec: Arc<dyn WireCodec>,
    receiver: usize,
    remaining_senders: usize,
}

/// Sends every partition to the worker with the same index, then receives
/// this worker's partitions from every worker.
///
/// Port 0 yields `(partition, block)` tuples as produced by `Partition`, port 1
/// yields the fan-out once. All sending happens in `open`. `next` returns
/// received tuples until every sender has signalled its end of stream, in
/// whatever order the messages arrive.
#[derive(Debug)]
pub struct PhysicalExchange {
    data: BoxedOperator,
    fanout: BoxedOperator,
    exchange_id: String,
    receiving: Option<Receiving>,
    buffered: VecDeque<Value>,
}

impl PhysicalExchange {
    pub fn new(data: BoxedOperator, fanout: BoxedOperator, exchange_id: impl Into<String>) -> Self {
        PhysicalExchange {
            data,
            fanout,
            exchange_id: exchange_id.into(),
            receiving: None,
            buffered: VecDeque::new(),
        }
    }

    fn send_all(&mut self, ctx: &ExecutionContext, transport: &dyn ExchangeTransport, fanout: usize) -> Result<()> {
        let exchange_id = self.exchange_id.as_str();
        let mut sent = 0;
        drain_with(&mut self.data, ctx, |row| {
            let fields = row.try_as_tuple()?;
            let (partition, block) = match fields {
                [partition, block] => (partition.try_as_usize()?, block.try_as_array()?),
                _ => {
                    return Err(DbError::protocol("Exchange input must be (partition, block) tuples")
                        .with_field("num_fields", fields.len()));
                }
            };
            if partition >= fanout {
                return Err(DbError::protocol("Partition out of range for exchange")
                    .with_field("partition", partition)
                    .with_field("fanout", fanout));
            }
            if block.is_empty() {
                return Ok(());
            }
            let rows: Vec<Value> = block.iter().cloned().collect();
            let payload = ctx.codec.encode_values(&rows)?;
            transport.send_message(exchange_id, partition, ExchangeMessage::Payload(payload))?;
            sent += rows.len();
            Ok(())
        })?;

        for receiver in 0..fanout {
            transport.send_message(exchange_id, receiver, ExchangeMessage::End)?;
        }
        tracing::debug!(exchange_id, worker = ctx.worker_index, sent, "sent exchange data");
        Ok(())
    }
}

impl Operator for PhysicalExchange {
    fn name(&self) -> &'static str {
        "exchange"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let transport = ctx.transport()?.clone();
        let fanout = read_single_scalar(&mut self.fanout, ctx)?;
        if ctx.worker_index >= fanout {
            return Err(DbError::protocol("Worker index out of range for exchange fan-out")
                .with_field("worker_index", ctx.worker_index)
                .with_field("fanout", fanout));
        }

        transport
            .start_exchange(&self.exchange_id, fanout)
            .context_fn(|| format!("Failed to start exchange '{}'", self.exchange_id))?;
        if let Err(e) = self.send_all(ctx, transport.as_ref(), fanout) {
            if let Err(finish_err) = transport.finish_exchange(&self.exchange_id) {
                tracing::warn!(%finish_err, "failed to finish exchange after error");
            }
            return Err(e);
        }

        self.buffered.clear();
        self.receiving = Some(Receiving {
            transport,
            codec: ctx.codec.clone(),
            receiver: ctx.worker_index,
            remaining_senders: fanout,
        });
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let receiving = self
            .receiving
            .as_mut()
            .ok_or_else(|| DbError::protocol("Exchange pulled before open"))?;

        loop {
            if let Some(v) = self.buffered.pop_front() {
                return Ok(Some(v));
            }
            if receiving.remaining_senders == 0 {
                return Ok(None);
            }
            match receiving
                .transport
                .receive_message(&self.exchange_id, receiving.receiver)?
            {
                ExchangeMessage::Payload(bytes) => {
                    self.buffered.extend(receiving.codec.decode_values(&bytes)?);
                }
                ExchangeMessage::End => {
                    receiving.remaining_senders -= 1;
                    tracing::trace!(
                        exchange_id = %self.exchange_id,
                        remaining = receiving.remaining_senders,
                        "sender finished"
                    );
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.buffered.clear();
        match self.receiving.take() {
            Some(receiving) => receiving.transport.finish_exchange(&self.exchange_id),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use dagflow_error::ErrorKind;

    use super::*;
    use crate::runtime::exchange::MemoryTransport;
    use crate::testutil::{VecSource, collect_all, leading_ints, test_context};

    fn partitioned(parts: &[(i64, Vec<i64>)]) -> VecSource {
        VecSource::new(
            parts
                .iter()
                .map(|(p, rows)| {
                    Value::tuple([
                        Value::int64(*p),
                        Value::array(rows.iter().map(|r| Value::tuple([Value::int64(*r)]))),
                    ])
                })
                .collect(),
        )
    }

    #[test]
    fn two_workers_exchange() {
        let transport = Arc::new(MemoryTransport::new());
        let inputs = [
            vec![(0, vec![1, 2]), (1, vec![3]), (1, vec![])],
            vec![(0, vec![4]), (1, vec![5, 6])],
        ];

        let handles: Vec<_> = inputs
            .into_iter()
            .enumerate()
            .map(|(worker, parts)| {
                let ctx = test_context()
                    .with_worker(worker, 2)
                    .with_transport(transport.clone());
                let data = partitioned(&parts).boxed();
                thread::spawn(move || {
                    let mut op = PhysicalExchange::new(data, VecSource::ints([2]).boxed(), "ex");
                    let mut out = leading_ints(&collect_all(&mut op, &ctx).unwrap());
                    out.sort();
                    out
                })
            })
            .collect();

        let results: Vec<Vec<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(vec![1, 2, 4], results[0]);
        assert_eq!(vec![3, 5, 6], results[1]);
        assert!(!transport.is_active("ex"));
    }

    #[test]
    fn single_worker_receives_own_data() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context().with_worker(0, 1).with_transport(transport);
        let mut op = PhysicalExchange::new(
            partitioned(&[(0, vec![7, 8])]).boxed(),
            VecSource::ints([1]).boxed(),
            "single",
        );
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![7, 8], leading_ints(&out));
    }

    #[test]
    fn partition_out_of_range() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context().with_worker(0, 1).with_transport(transport);
        let mut op = PhysicalExchange::new(
            partitioned(&[(3, vec![1])]).boxed(),
            VecSource::ints([1]).boxed(),
            "bad",
        );
        let err = op.open(&ctx).unwrap_err();
        assert_eq!(ErrorKind::ProtocolViolation, err.kind());
    }

    #[test]
    fn missing_transport() {
        let ctx = test_context();
        let mut op = PhysicalExchange::new(
            partitioned(&[]).boxed(),
            VecSource::ints([1]).boxed(),
            "none",
        );
        let err = op.open(&ctx).unwrap_err();
        assert_eq!(ErrorKind::Resource, err.kind());
    }
}
