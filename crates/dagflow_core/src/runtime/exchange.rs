use std::collections::VecDeque;
use std::fmt::Debug;

use bytes::Bytes;
use dagflow_error::{DbError, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeMessage {
    /// Encoded values.
    Payload(Bytes),
    /// The sender has nothing more for this receiver.
    End,
}

/// Transport moving encoded values between workers taking part in an
/// exchange.
///
/// Every sender signals `End` exactly once per receiver, after all of its
/// payloads for that receiver. Waiting on a sender that never completes is the
/// transport's problem, the operator doesn't time out.
pub trait ExchangeTransport: Debug + Sync + Send {
    /// Register participation in an exchange with `num_receivers` receivers.
    ///
    /// Every worker calls this. Only the first call sets up the exchange.
    fn start_exchange(&self, exchange_id: &str, num_receivers: usize) -> Result<()>;

    fn send_message(&self, exchange_id: &str, receiver: usize, msg: ExchangeMessage) -> Result<()>;

    /// Receive the next message for `receiver`, blocking until one arrives.
    fn receive_message(&self, exchange_id: &str, receiver: usize) -> Result<ExchangeMessage>;

    /// Called once per worker when it's done with the exchange.
    fn finish_exchange(&self, exchange_id: &str) -> Result<()>;
}

#[derive(Debug)]
struct ExchangeState {
    queues: Vec<VecDeque<ExchangeMessage>>,
    finished: usize,
}

/// Exchange transport for workers running in the same process.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    exchanges: Mutex<HashMap<String, ExchangeState>>,
    cond: Condvar,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, exchange_id: &str) -> bool {
        self.exchanges.lock().contains_key(exchange_id)
    }
}

fn missing_exchange(exchange_id: &str) -> DbError {
    DbError::protocol("Exchange not started").with_field("exchange_id", exchange_id)
}

impl ExchangeTransport for MemoryTransport {
    fn start_exchange(&self, exchange_id: &str, num_receivers: usize) -> Result<()> {
        let mut exchanges = self.exchanges.lock();
        let state = exchanges
            .entry(exchange_id.to_string())
            .or_insert_with(|| ExchangeState {
                queues: (0..num_receivers).map(|_| VecDeque::new()).collect(),
                finished: 0,
            });

        if state.queues.len() != num_receivers {
            return Err(DbError::protocol("Workers disagree on exchange fan-out")
                .with_field("exchange_id", exchange_id)
                .with_field("expected", state.queues.len())
                .with_field("got", num_receivers));
        }
        Ok(())
    }

    fn send_message(&self, exchange_id: &str, receiver: usize, msg: ExchangeMessage) -> Result<()> {
        let mut exchanges = self.exchanges.lock();
        let state = exchanges
            .get_mut(exchange_id)
            .ok_or_else(|| missing_exchange(exchange_id))?;
        let num_receivers = state.queues.len();
        let queue = state.queues.get_mut(receiver).ok_or_else(|| {
            DbError::protocol("Exchange receiver out of range")
                .with_field("receiver", receiver)
                .with_field("num_receivers", num_receivers)
        })?;
        queue.push_back(msg);
        self.cond.notify_all();
        Ok(())
    }

    fn receive_message(&self, exchange_id: &str, receiver: usize) -> Result<ExchangeMessage> {
        let mut exchanges = self.exchanges.lock();
        loop {
            let state = exchanges
                .get_mut(exchange_id)
                .ok_or_else(|| missing_exchange(exchange_id))?;
            let queue = state.queues.get_mut(receiver).ok_or_else(|| {
                DbError::protocol("Exchange receiver out of range").with_field("receiver", receiver)
            })?;
            if let Some(msg) = queue.pop_front() {
                return Ok(msg);
            }
            self.cond.wait(&mut exchanges);
        }
    }

    fn finish_exchange(&self, exchange_id: &str) -> Result<()> {
        let mut exchanges = self.exchanges.lock();
        let state = exchanges
            .get_mut(exchange_id)
            .ok_or_else(|| missing_exchange(exchange_id))?;
        state.finished += 1;
        if state.finished >= state.queues.len() {
            exchanges.remove(exchange_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn messages_in_order_per_receiver() {
        let t = MemoryTransport::new();
        t.start_exchange("x", 2).unwrap();
        t.send_message("x", 1, ExchangeMessage::Payload(Bytes::from_static(b"a"))).unwrap();
        t.send_message("x", 1, ExchangeMessage::End).unwrap();

        assert_eq!(
            ExchangeMessage::Payload(Bytes::from_static(b"a")),
            t.receive_message("x", 1).unwrap()
        );
        assert_eq!(ExchangeMessage::End, t.receive_message("x", 1).unwrap());
        t.send_message("x", 2, ExchangeMessage::End).unwrap_err();
    }

    #[test]
    fn receive_blocks_until_send() {
        let t = Arc::new(MemoryTransport::new());
        t.start_exchange("x", 1).unwrap();

        let t2 = t.clone();
        let handle = std::thread::spawn(move || t2.receive_message("x", 0).unwrap());
        t.send_message("x", 0, ExchangeMessage::End).unwrap();

        assert_eq!(ExchangeMessage::End, handle.join().unwrap());
    }

    #[test]
    fn removed_after_all_finish() {
        let t = MemoryTransport::new();
        t.start_exchange("x", 2).unwrap();
        t.start_exchange("x", 2).unwrap();
        t.start_exchange("x", 3).unwrap_err();

        t.finish_exchange("x").unwrap();
        assert!(t.is_active("x"));
        t.finish_exchange("x").unwrap();
        assert!(!t.is_active("x"));
    }
}
