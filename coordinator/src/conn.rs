use anyhow::bail;
use common::message::Msg;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// One framed inbound message, tagged with the identity of the prover whose
/// connection delivered it.
#[derive(Debug)]
pub struct InboundMsg {
    pub public_key: String,
    pub payload: Vec<u8>,
}

/// A connected prover. Sessions refer to provers only by public key; the
/// live connection is always re-resolved through the registry, so a prover
/// that went away is skipped naturally.
pub struct ProverConn {
    pub public_key: String,
    pub name: String,
    tx: mpsc::Sender<Msg>,
    closed: AtomicBool,
}

impl ProverConn {
    pub fn new(public_key: String, name: String, tx: mpsc::Sender<Msg>) -> Self {
        ProverConn {
            public_key,
            name,
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a frame on the outbound channel. The channel is bounded; a full
    /// or disconnected channel is reported as a send failure and the caller
    /// treats the prover as dead.
    pub fn send_message(&self, msg: Msg) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("prover {} connection is closed", self.public_key);
        }
        if let Err(e) = self.tx.try_send(msg) {
            if matches!(e, mpsc::error::TrySendError::Closed(_)) {
                self.mark_closed();
            }
            bail!("could not queue frame for prover {}: {}", self.public_key, e);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Set of live prover connections. Guarded by its own lock, which is never
/// taken while the session table lock is held in the reverse order.
#[derive(Default)]
pub struct ConnRegistry {
    conns: RwLock<Vec<Arc<ProverConn>>>,
}

impl ConnRegistry {
    pub fn add(&self, conn: Arc<ProverConn>) {
        self.conns.write().unwrap().push(conn);
    }

    /// Idempotent removal by connection identity.
    pub fn remove(&self, conn: &Arc<ProverConn>) {
        self.conns
            .write()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, conn));
    }

    /// Shallow copy of the live set; the caller may reorder or shrink its
    /// copy freely during selection.
    pub fn snapshot(&self) -> Vec<Arc<ProverConn>> {
        self.conns.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::message::MsgType;

    fn test_conn(public_key: &str) -> (Arc<ProverConn>, mpsc::Receiver<Msg>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Arc::new(ProverConn::new(
                public_key.to_string(),
                format!("prover-{public_key}"),
                tx,
            )),
            rx,
        )
    }

    #[test]
    fn test_registry_add_remove_idempotent() {
        let registry = ConnRegistry::default();
        let (conn_a, _rx_a) = test_conn("aa");
        let (conn_b, _rx_b) = test_conn("bb");
        registry.add(conn_a.clone());
        registry.add(conn_b.clone());
        assert_eq!(registry.snapshot().len(), 2);

        registry.remove(&conn_a);
        registry.remove(&conn_a);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].public_key, "bb");
    }

    #[test]
    fn test_snapshot_is_shallow_copy() {
        let registry = ConnRegistry::default();
        let (conn, _rx) = test_conn("aa");
        registry.add(conn);
        let mut snapshot = registry.snapshot();
        snapshot.clear();
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_send_fails_after_close() {
        let (conn, _rx) = test_conn("aa");
        let msg = Msg {
            msg_type: MsgType::Error,
            payload: vec![],
        };
        assert!(conn.send_message(msg.clone()).is_ok());
        conn.mark_closed();
        assert!(conn.send_message(msg).is_err());
    }

    #[test]
    fn test_send_marks_closed_on_dropped_receiver() {
        let (conn, rx) = test_conn("aa");
        drop(rx);
        let msg = Msg {
            msg_type: MsgType::Error,
            payload: vec![],
        };
        assert!(conn.send_message(msg).is_err());
        assert!(conn.is_closed());
    }
}
