use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};

use coordinator::{
    api,
    config::RuntimeConfig,
    conn::ConnRegistry,
    database::Database,
    manager::Manager,
    metrics, transport,
    verifier::{ProofVerifier, RpcVerifier},
};

const INBOUND_BUFFER_SIZE: usize = 256;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let cfg = RuntimeConfig::from_toml(&args.config).expect("Config is missing");
    metrics::init_registry();

    let store = Arc::new(Database::new(&cfg.database_url)?);
    store.migrate().await?;

    let verifier: Option<Arc<dyn ProofVerifier>> = match cfg.verifier_endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => Some(Arc::new(RpcVerifier::new(endpoint))),
        _ => {
            log::info!("verifier disabled, proofs will be accepted as-is");
            None
        }
    };

    let conns = Arc::new(ConnRegistry::default());
    let shutdown = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER_SIZE);

    let manager = Arc::new(Manager::new(
        cfg.clone(),
        store,
        verifier,
        conns.clone(),
        shutdown.clone(),
    ));
    manager.start().await?;

    let endpoint = cfg.endpoint.parse()?;
    let transport = transport::serve(endpoint, conns, inbound_tx, shutdown.clone());
    let debug_api = api::start_debug_api(&cfg.debug_api_addr, manager.clone()).await?;
    let dispatch = manager.clone().run(inbound_rx);

    let metrics_addr = cfg.metrics_addr.parse()?;
    let make_svc = make_service_fn(move |_| {
        let registry = metrics::REGISTRY_INSTANCE.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();
                    Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                }
            }))
        }
    });
    let metrics_server = hyper::Server::bind(&metrics_addr).serve(make_svc);

    tokio::pin!(transport);
    tokio::pin!(dispatch);
    tokio::pin!(metrics_server);

    log::info!("coordinator listening on {}", cfg.endpoint);

    tokio::select! {
        _ = &mut dispatch => {}
        _ = &mut transport => {}
        res = &mut metrics_server => res?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            // Tear the transport down first so no new messages arrive, then
            // let outstanding collectors reconcile the store.
            shutdown.cancel();
            transport.await;
            dispatch.await;
        }
    }

    let _ = debug_api.stop();
    Ok(())
}
