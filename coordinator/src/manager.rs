use anyhow::bail;
use common::message::{BlockTraceMsg, Msg, MsgType, ProofMsg, ProofStatus};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{OrderSession, RuntimeConfig};
use crate::conn::{ConnRegistry, InboundMsg, ProverConn};
use crate::database::{Task, TaskStatus, TaskStore};
use crate::metrics;
use crate::verifier::ProofVerifier;

/// Capacity of a session's finish channel. Lets that many participants
/// deliver results without blocking the proof handler while it holds the
/// session table read lock.
const FINISH_SIGNAL_BUFFER_SIZE: usize = 10;
const DISPATCH_INTERVAL_SECS: u64 = 3;
const RECOVERY_BATCH_SIZE: usize = 256;

pub fn get_timestamp() -> u64 {
    let now = SystemTime::now();
    let duration_since_epoch = now.duration_since(UNIX_EPOCH).unwrap();
    duration_since_epoch.as_secs()
}

/// Per-session status of a participating prover. A participant leaves
/// `Assigned` at most once; later submissions are idempotent no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProverStatus {
    Assigned,
    ProofValid,
    ProofInvalid,
}

struct FinishSignal {
    public_key: String,
    status: ProverStatus,
}

/// An ongoing proof generation session. Provers are keyed by the hex
/// encoding of their public key.
struct Session {
    id: u64,
    provers: HashMap<String, ProverStatus>,
    prover_names: HashMap<String, String>,
    started_at: u64,
    finish_tx: mpsc::Sender<FinishSignal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionProver {
    pub public_key: String,
    pub name: String,
    pub status: ProverStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub started_at: u64,
    pub provers: Vec<SessionProver>,
}

/// Snapshot of a session that ended in failure, kept for operator
/// introspection only.
#[derive(Debug, Clone, Serialize)]
pub struct FailedSessionInfo {
    pub id: u64,
    pub started_at: u64,
    pub provers: Vec<SessionProver>,
    pub error: String,
}

fn session_provers(session: &Session) -> Vec<SessionProver> {
    let mut provers: Vec<SessionProver> = session
        .provers
        .iter()
        .map(|(public_key, status)| SessionProver {
            public_key: public_key.clone(),
            name: session
                .prover_names
                .get(public_key)
                .cloned()
                .unwrap_or_default(),
            status: *status,
        })
        .collect();
    provers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
    provers
}

/// Outcome of processing one proof submission against the store and the
/// verifier. `db_failed` triggers the best-effort rollback to `Unassigned`;
/// `success` decides the participant status signalled to the collector.
struct ProofOutcome {
    success: bool,
    db_failed: bool,
    error: Option<anyhow::Error>,
}

/// The coordinator core: tracks prover sessions, assigns work to idle
/// provers, validates returning proofs under a per-session deadline, and
/// reconciles task status with the store. All collaborators are injected;
/// this is the only long-lived stateful object in the process.
pub struct Manager {
    cfg: RuntimeConfig,
    store: Arc<dyn TaskStore>,
    verifier: Option<Arc<dyn ProofVerifier>>,
    conns: Arc<ConnRegistry>,
    /// Single source of truth for in-memory session state. The proof handler
    /// holds the read lock across its whole body including the finish-signal
    /// send; the collector takes the write lock to mutate or tear down. That
    /// ordering is what keeps a proof from ever landing on a torn-down
    /// session.
    sessions: RwLock<HashMap<u64, Session>>,
    failed_sessions: Mutex<HashMap<u64, FailedSessionInfo>>,
    rng: Mutex<StdRng>,
    collectors: TaskTracker,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(
        cfg: RuntimeConfig,
        store: Arc<dyn TaskStore>,
        verifier: Option<Arc<dyn ProofVerifier>>,
        conns: Arc<ConnRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Manager {
            cfg,
            store,
            verifier,
            conns,
            sessions: RwLock::new(HashMap::new()),
            failed_sessions: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            collectors: TaskTracker::new(),
            shutdown,
        }
    }

    /// Crash recovery: a task that was in flight when a previous run died is
    /// returned to the pool before any dispatching starts.
    pub async fn start(&self) -> anyhow::Result<()> {
        loop {
            let tasks = self
                .store
                .fetch_by_status(TaskStatus::Assigned, OrderSession::Asc, RECOVERY_BATCH_SIZE)
                .await?;
            if tasks.is_empty() {
                break;
            }
            for task in &tasks {
                log::warn!("resetting task {} to unassigned after restart", task.id);
                self.store
                    .set_status(task.id, TaskStatus::Unassigned)
                    .await?;
            }
        }
        log::info!("coordinator started");
        Ok(())
    }

    /// Dispatch loop: a 3-second ticker drives assignment, inbound frames
    /// drive proof handling, and the shutdown token ends the loop. After
    /// cancellation, outstanding collectors are drained so the store is
    /// reconciled before returning.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMsg>) {
        let period = Duration::from_secs(DISPATCH_INTERVAL_SECS);
        let mut tick = time::interval_at(time::Instant::now() + period, period);
        let mut pending: VecDeque<Task> = VecDeque::new();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if pending.is_empty() {
                        let idle = self.idle_prover_count().await;
                        if idle == 0 {
                            continue;
                        }
                        match self
                            .store
                            .fetch_by_status(TaskStatus::Unassigned, self.cfg.order_session, idle)
                            .await
                        {
                            Ok(tasks) => pending.extend(tasks),
                            Err(e) => {
                                log::error!("failed to fetch unassigned tasks: {e:?}");
                                continue;
                            }
                        }
                    }
                    while let Some(task) = pending.front().cloned() {
                        if !self.start_proof_session(&task).await {
                            break;
                        }
                        pending.pop_front();
                    }
                }
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = self.handle_message(&msg.public_key, &msg.payload).await {
                                log::error!("could not handle message from prover {}: {e:?}", msg.public_key);
                            }
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        log::info!("dispatch loop stopped, draining collectors");
        self.collectors.close();
        self.collectors.wait().await;
    }

    /// Assign one task to one idle prover. Returns false when no prover
    /// could take the task; the task is then retried on a later tick.
    async fn start_proof_session(self: &Arc<Self>, task: &Task) -> bool {
        let Some(conn) = self.select_idle_prover().await else {
            return false;
        };
        log::info!("start proof generation session, id {}", task.id);

        let trace_msg = BlockTraceMsg {
            id: task.id,
            traces: task.traces.clone(),
        };
        let msg = match Msg::new(MsgType::BlockTrace, &trace_msg) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("could not create block trace message: {e:?}");
                return false;
            }
        };
        if let Err(e) = conn.send_message(msg) {
            log::error!("could not send block trace to prover: {e:?}");
            return false;
        }
        log::info!(
            "prover is picked, name {} public_key {}",
            conn.name,
            conn.public_key
        );

        let (finish_tx, finish_rx) = mpsc::channel(FINISH_SIGNAL_BUFFER_SIZE);
        let session = Session {
            id: task.id,
            provers: HashMap::from([(conn.public_key.clone(), ProverStatus::Assigned)]),
            prover_names: HashMap::from([(conn.public_key.clone(), conn.name.clone())]),
            started_at: get_timestamp(),
            finish_tx,
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&task.id) {
                log::error!("proof generation session {} already exists", task.id);
                return false;
            }
            sessions.insert(task.id, session);
            metrics::ACTIVE_SESSIONS_GAUGE.set(sessions.len() as f64);
        }

        if let Err(e) = self.store.set_status(task.id, TaskStatus::Assigned).await {
            log::error!("failed to mark task {} as assigned: {e:?}", task.id);
            let mut sessions = self.sessions.write().await;
            sessions.remove(&task.id);
            metrics::ACTIVE_SESSIONS_GAUGE.set(sessions.len() as f64);
            drop(sessions);
            if let Err(e) = self.store.set_status(task.id, TaskStatus::Unassigned).await {
                log::error!("failed to reset task {} to unassigned: {e:?}", task.id);
            }
            return false;
        }

        let manager = self.clone();
        let id = task.id;
        self.collectors.spawn(async move {
            manager.collect_proofs(id, finish_rx).await;
        });
        metrics::SESSIONS_STARTED_COUNTER.inc();
        true
    }

    /// Uniformly random pick over the registry snapshot, dropping closed and
    /// busy provers. Random tie-breaking avoids pinning work to one prover
    /// when their throughput differs.
    async fn select_idle_prover(&self) -> Option<Arc<ProverConn>> {
        let mut candidates = self.conns.snapshot();
        while !candidates.is_empty() {
            let idx = self.rng.lock().unwrap().gen_range(0..candidates.len());
            let conn = candidates.swap_remove(idx);
            if conn.is_closed() {
                log::debug!("prover is closed, public_key {}", conn.public_key);
                self.conns.remove(&conn);
                continue;
            }
            if self.is_prover_busy(&conn.public_key).await {
                log::debug!("prover is busy, public_key {}", conn.public_key);
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// A prover stays busy while any session still lists it as `Assigned`.
    /// Finished sessions keep their entry until the deadline tears them
    /// down, so every session has to be scanned.
    async fn is_prover_busy(&self, public_key: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .any(|s| s.provers.get(public_key) == Some(&ProverStatus::Assigned))
    }

    async fn idle_prover_count(&self) -> usize {
        let mut count = 0;
        for conn in self.conns.snapshot() {
            if !self.is_prover_busy(&conn.public_key).await {
                count += 1;
            }
        }
        count
    }

    /// Collect proof outcomes for one session until the deadline, then
    /// finalize. The session is only deleted here; a late proof between
    /// deadline and teardown is rejected by the handler's lookup.
    async fn collect_proofs(self: Arc<Self>, id: u64, mut finish_rx: mpsc::Receiver<FinishSignal>) {
        let deadline = time::sleep(Duration::from_secs(self.cfg.collection_time_minutes * 60));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let mut sessions = self.sessions.write().await;
                    let Some(session) = sessions.remove(&id) else {
                        log::error!("proof generation session {id} vanished before finalization");
                        return;
                    };
                    metrics::ACTIVE_SESSIONS_GAUGE.set(sessions.len() as f64);

                    let valid_provers: Vec<&String> = session
                        .provers
                        .iter()
                        .filter(|(_, status)| **status == ProverStatus::ProofValid)
                        .map(|(public_key, _)| public_key)
                        .collect();

                    if valid_provers.is_empty() {
                        let errmsg = "proof generation session ended without receiving any valid proofs";
                        self.record_failed_session(&session, errmsg);
                        log::warn!("{errmsg}, session id {id}");
                        if let Err(e) = self.store.set_status(id, TaskStatus::Failed).await {
                            log::error!("failed to mark task {id} as failed: {e:?}");
                        }
                        metrics::TASKS_FAILED_COUNTER.inc();
                        return;
                    }

                    // Uniform winner pick, placeholder for reward attribution.
                    let idx = self.rng.lock().unwrap().gen_range(0..valid_provers.len());
                    let _winner = valid_provers[idx];
                    return;
                }
                Some(signal) = finish_rx.recv() => {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.get_mut(&id) {
                        session.provers.insert(signal.public_key, signal.status);
                    }
                }
            }
        }
    }

    /// Decode one framed inbound message and route it.
    pub async fn handle_message(&self, public_key: &str, payload: &[u8]) -> anyhow::Result<()> {
        let msg = Msg::from_json(payload)?;
        match msg.msg_type {
            MsgType::Error => {
                log::error!(
                    "error message received from prover {public_key}: {}",
                    String::from_utf8_lossy(&msg.payload)
                );
                Ok(())
            }
            MsgType::Register => {
                // Registration is completed by the transport before any
                // frame reaches the coordinator.
                bail!("attempted handshake at the wrong time")
            }
            MsgType::BlockTrace => bail!("received illegal coordinator-to-prover message"),
            MsgType::Proof => self.handle_zk_proof(public_key, &msg.payload).await,
        }
    }

    /// Handle a proof submitted by a prover. The session table read lock is
    /// held until the end of the function so that teardown cannot race the
    /// finish-signal send.
    async fn handle_zk_proof(&self, public_key: &str, payload: &[u8]) -> anyhow::Result<()> {
        let msg: ProofMsg = serde_json::from_slice(payload)?;

        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(&msg.id) else {
            bail!("proof generation session for id {} does not exist", msg.id);
        };
        let proof_time_sec = get_timestamp().saturating_sub(session.started_at);

        match session.provers.get(public_key) {
            None => bail!(
                "prover {} is not eligible to partake in proof session {}",
                public_key,
                msg.id
            ),
            Some(ProverStatus::ProofValid) => {
                // Repeated valid submissions are refused silently to keep a
                // prover from replaying them as a denial of service.
                log::warn!(
                    "prover has already submitted valid proof in proof session, prover {} proof id {}",
                    public_key,
                    msg.id
                );
                return Ok(());
            }
            Some(_) => {}
        }
        log::info!("received zk proof, proof id {}", msg.id);
        metrics::PROOFS_RECEIVED_COUNTER.inc();

        let outcome = self.process_proof(session, &msg, proof_time_sec).await;

        if outcome.db_failed {
            // Best-effort rollback so the dispatcher can hand the task out
            // again.
            if let Err(e) = self.store.set_status(msg.id, TaskStatus::Unassigned).await {
                log::error!("failed to reset task {} to unassigned: {e:?}", msg.id);
            }
        }
        let status = if outcome.success && !outcome.db_failed {
            ProverStatus::ProofValid
        } else {
            ProverStatus::ProofInvalid
        };
        if let Err(e) = session.finish_tx.try_send(FinishSignal {
            public_key: public_key.to_string(),
            status,
        }) {
            log::error!("failed to signal session {}: {e}", msg.id);
        }

        match outcome.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Persist a submission, run verification, and move the task to its
    /// terminal status. Storage failures short-circuit; a verifier error is
    /// distinct from a clean `false` and is recorded before the proof is
    /// treated as invalid.
    async fn process_proof(
        &self,
        session: &Session,
        msg: &ProofMsg,
        proof_time_sec: u64,
    ) -> ProofOutcome {
        if msg.status != ProofStatus::Ok {
            log::error!(
                "prover failed to generate proof, proof id {} error {:?}",
                msg.id,
                msg.error
            );
            let mut db_failed = false;
            if let Err(e) = self.store.set_status(msg.id, TaskStatus::Failed).await {
                log::error!("failed to mark task {} as failed: {e:?}", msg.id);
                db_failed = true;
            }
            metrics::TASKS_FAILED_COUNTER.inc();
            self.record_failed_session(
                session,
                msg.error.as_deref().unwrap_or("prover reported failure"),
            );
            return ProofOutcome {
                success: false,
                db_failed,
                error: None,
            };
        }

        if let Err(e) = self
            .store
            .set_proof(msg.id, &msg.proof, &msg.final_pair, proof_time_sec)
            .await
        {
            log::error!("failed to store proof, proof id {}: {e:?}", msg.id);
            return ProofOutcome {
                success: false,
                db_failed: true,
                error: Some(e),
            };
        }
        if let Err(e) = self.store.set_status(msg.id, TaskStatus::Proved).await {
            log::error!("failed to mark task {} as proved: {e:?}", msg.id);
            return ProofOutcome {
                success: false,
                db_failed: true,
                error: Some(e),
            };
        }

        let success = match &self.verifier {
            Some(verifier) => {
                let tasks = match self.store.fetch_by_id(msg.id).await {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        log::error!("failed to fetch task {} for verification: {e:?}", msg.id);
                        return ProofOutcome {
                            success: false,
                            db_failed: false,
                            error: Some(e),
                        };
                    }
                };
                let Some(task) = tasks.first() else {
                    log::error!("task {} vanished before verification", msg.id);
                    return ProofOutcome {
                        success: false,
                        db_failed: false,
                        error: None,
                    };
                };
                match verifier.verify(task, msg).await {
                    Ok(valid) => {
                        log::info!(
                            "verified zk proof, verification result {} proof id {}",
                            valid,
                            msg.id
                        );
                        valid
                    }
                    Err(e) => {
                        // A verifier that cannot evaluate is not the same as
                        // an invalid proof; record it, then fail the task
                        // anyway. TODO: return the error and leave the task
                        // assigned for retry once the verifier deployment is
                        // stable enough.
                        self.record_failed_session(session, &e.to_string());
                        log::error!("failed to verify zk proof, proof id {}: {e:?}", msg.id);
                        false
                    }
                }
            }
            None => {
                log::info!("verifier disabled, proof id {} accepted as-is", msg.id);
                true
            }
        };

        let status = if success {
            metrics::TASKS_VERIFIED_COUNTER.inc();
            TaskStatus::Verified
        } else {
            metrics::TASKS_FAILED_COUNTER.inc();
            TaskStatus::Failed
        };
        if let Err(e) = self.store.set_status(msg.id, status).await {
            log::error!("failed to update task {} status: {e:?}", msg.id);
            return ProofOutcome {
                success,
                db_failed: true,
                error: Some(e),
            };
        }

        ProofOutcome {
            success,
            db_failed: false,
            error: None,
        }
    }

    /// Keep the first failure recorded for a session; a later, more generic
    /// failure must not shadow the original cause.
    fn record_failed_session(&self, session: &Session, errmsg: &str) {
        let mut failed = self.failed_sessions.lock().unwrap();
        failed
            .entry(session.id)
            .or_insert_with(|| FailedSessionInfo {
                id: session.id,
                started_at: session.started_at,
                provers: session_provers(session),
                error: errmsg.to_string(),
            });
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|session| SessionInfo {
                id: session.id,
                started_at: session.started_at,
                provers: session_provers(session),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn list_failed_sessions(&self) -> Vec<FailedSessionInfo> {
        let failed = self.failed_sessions.lock().unwrap();
        let mut infos: Vec<FailedSessionInfo> = failed.values().cloned().collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
