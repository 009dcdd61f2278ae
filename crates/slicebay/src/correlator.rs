//! Request/reply correlation over the transport.
//!
//! Each outbound call gets the next sequence id and a parked oneshot. The
//! dispatch loop hands every `ack` to [`Correlator::resolve`], which completes
//! the matching call by id regardless of arrival order.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, SliceError};
use crate::protocol::{EngineCall, Envelope, Reply};
use crate::transport::TransportSender;

type ReplySlot = oneshot::Sender<Result<Reply>>;

#[derive(Default)]
struct State {
    next_seq: u64,
    pending: HashMap<u64, ReplySlot>,
    closed: bool,
}

/// Promise-per-call wrapper around a [`TransportSender`].
pub struct Correlator {
    sender: TransportSender,
    state: Mutex<State>,
}

impl Correlator {
    /// Wrap a transport sender. Sequence ids start at 1.
    pub fn new(sender: TransportSender) -> Self {
        Self {
            sender,
            state: Mutex::new(State {
                next_seq: 1,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch a call and wait for its reply.
    ///
    /// The outer error covers transport and session failures; an engine-side
    /// rejection comes back as [`Reply::Err`] so the caller can tag it.
    pub async fn call(
        &self,
        call: EngineCall,
        data: Value,
        buffers: Vec<Vec<u8>>,
    ) -> Result<Reply> {
        let (seq, rx) = {
            let mut state = self.state();
            if state.closed {
                return Err(SliceError::EngineSessionClosed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(seq, tx);
            (seq, rx)
        };

        tracing::trace!(seq, call = %call, "dispatch");
        let envelope = Envelope::new(call, seq, data).with_buffers(buffers);
        if let Err(err) = self.sender.send(envelope) {
            self.state().pending.remove(&seq);
            return Err(err);
        }

        // A dropped slot means the correlator itself went away.
        rx.await.unwrap_or(Err(SliceError::EngineSessionClosed))
    }

    /// Send a notification that expects no reply.
    pub fn notify(&self, call: EngineCall, data: Value) -> Result<()> {
        if self.state().closed {
            return Err(SliceError::EngineSessionClosed);
        }
        self.sender.send(Envelope::notify(call, data))
    }

    /// Complete the pending call `seq` with an ack payload.
    ///
    /// Returns `false` for unmatched acks, which are logged and dropped.
    pub fn resolve(&self, seq: u64, payload: Value) -> bool {
        let Some(slot) = self.state().pending.remove(&seq) else {
            tracing::debug!(seq, "discarding unmatched ack");
            return false;
        };
        // The caller may have given up on the call; that is not an error here.
        let _ = slot.send(Reply::from_value(payload));
        true
    }

    /// Reject every pending call with `EngineSessionClosed` and refuse new ones.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<(u64, ReplySlot)> = {
            let mut state = self.state();
            state.closed = true;
            state.pending.drain().collect()
        };
        let count = drained.len();
        for (seq, slot) in drained {
            tracing::debug!(seq, "abandoning call");
            let _ = slot.send(Err(SliceError::EngineSessionClosed));
        }
        count
    }

    /// Number of calls awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Whether [`abandon_all`](Self::abandon_all) has run.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel, TransportReceiver};
    use serde_json::json;
    use std::sync::Arc;

    fn correlator() -> (Arc<Correlator>, TransportReceiver) {
        let (orchestrator, engine) = channel();
        let (tx, _unused_rx) = orchestrator.split();
        let (_unused_tx, rx) = engine.split();
        (Arc::new(Correlator::new(tx)), rx)
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one() {
        let (corr, mut engine_rx) = correlator();
        let task = {
            let corr = corr.clone();
            tokio::spawn(async move { corr.call(EngineCall::Parse, json!(null), vec![]).await })
        };
        let env = engine_rx.recv().await.unwrap();
        assert_eq!(env.seq, 1);
        assert_eq!(env.f, "kiri.api.parse");
        assert!(corr.resolve(env.seq, json!({"ok": "parsed"})));
        assert_eq!(task.await.unwrap().unwrap(), Reply::Ok(json!("parsed")));
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (corr, mut engine_rx) = correlator();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let corr = corr.clone();
            tasks.push(tokio::spawn(async move {
                corr.call(EngineCall::Slice, json!(i), vec![]).await
            }));
        }

        let mut envelopes = Vec::new();
        for _ in 0..3 {
            envelopes.push(engine_rx.recv().await.unwrap());
        }
        assert_eq!(corr.pending_count(), 3);

        // Reply in reverse dispatch order, echoing each call's own payload.
        for env in envelopes.iter().rev() {
            assert!(corr.resolve(env.seq, json!({ "ok": env.data.clone() })));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), Reply::Ok(json!(i)));
        }
        assert_eq!(corr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_ack_is_ignored() {
        let (corr, _engine_rx) = correlator();
        assert!(!corr.resolve(42, json!({"ok": null})));
    }

    #[tokio::test]
    async fn test_abandon_rejects_and_stale_reply_is_dropped() {
        let (corr, mut engine_rx) = correlator();
        let task = {
            let corr = corr.clone();
            tokio::spawn(async move { corr.call(EngineCall::Export, json!(null), vec![]).await })
        };
        let env = engine_rx.recv().await.unwrap();

        assert_eq!(corr.abandon_all(), 1);
        assert_eq!(task.await.unwrap(), Err(SliceError::EngineSessionClosed));

        // A late reply for the abandoned id resolves nothing.
        assert!(!corr.resolve(env.seq, json!({"ok": "late"})));
        assert!(corr.is_closed());

        let again = corr.call(EngineCall::Parse, json!(null), vec![]).await;
        assert_eq!(again, Err(SliceError::EngineSessionClosed));
    }

    #[tokio::test]
    async fn test_send_failure_cleans_up() {
        let (orchestrator, engine) = channel();
        let (tx, _rx) = orchestrator.split();
        drop(engine);
        let corr = Correlator::new(tx);
        let result = corr.call(EngineCall::Parse, json!(null), vec![]).await;
        tokio_test::assert_err!(result);
        assert_eq!(corr.pending_count(), 0);
    }
}
