use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();
    pub static ref CONNECTED_PROVERS_GAUGE: Gauge = Gauge::with_opts(Opts::new(
        "connected_provers",
        "number of registered prover connections"
    ))
    .unwrap();
    pub static ref ACTIVE_SESSIONS_GAUGE: Gauge = Gauge::with_opts(Opts::new(
        "active_sessions",
        "number of in-flight proof generation sessions"
    ))
    .unwrap();
    pub static ref SESSIONS_STARTED_COUNTER: Counter = Counter::with_opts(Opts::new(
        "sessions_started",
        "proof generation sessions dispatched"
    ))
    .unwrap();
    pub static ref PROOFS_RECEIVED_COUNTER: Counter = Counter::with_opts(Opts::new(
        "proofs_received",
        "proof submissions received from provers"
    ))
    .unwrap();
    pub static ref TASKS_VERIFIED_COUNTER: Counter =
        Counter::with_opts(Opts::new("tasks_verified", "tasks marked verified")).unwrap();
    pub static ref TASKS_FAILED_COUNTER: Counter =
        Counter::with_opts(Opts::new("tasks_failed", "tasks marked failed")).unwrap();
}

pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(CONNECTED_PROVERS_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ACTIVE_SESSIONS_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SESSIONS_STARTED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(PROOFS_RECEIVED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(TASKS_VERIFIED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(TASKS_FAILED_COUNTER.clone()));
}
