//! Websocket front door for provers. A connection must present a `Register`
//! frame first; after that the socket is pumped in both directions until
//! either side goes away. Identity is taken as presented, no admission
//! checks beyond it.

use common::message::{Msg, MsgType, RegisterMsg};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::conn::{ConnRegistry, InboundMsg, ProverConn};
use crate::metrics;

/// Frames queued per prover before the coordinator considers it dead.
const OUTBOUND_BUFFER_SIZE: usize = 16;

pub async fn serve(
    addr: SocketAddr,
    conns: Arc<ConnRegistry>,
    inbound_tx: mpsc::Sender<InboundMsg>,
    shutdown: CancellationToken,
) {
    let conns = warp::any().map(move || conns.clone());
    let inbound_tx = warp::any().map(move || inbound_tx.clone());
    let route = warp::path::end()
        .and(warp::ws())
        .and(conns)
        .and(inbound_tx)
        .map(|ws: warp::ws::Ws, conns, inbound_tx| {
            ws.on_upgrade(move |socket| prover_connection(socket, conns, inbound_tx))
        });

    let (bound, server) = warp::serve(route).bind_with_graceful_shutdown(addr, async move {
        shutdown.cancelled().await;
    });
    log::info!("prover transport listening on {bound}");
    server.await;
}

async fn prover_connection(
    socket: WebSocket,
    conns: Arc<ConnRegistry>,
    inbound_tx: mpsc::Sender<InboundMsg>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(register) = read_register(&mut ws_rx).await else {
        let _ = ws_tx.close().await;
        return;
    };

    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
    let conn = Arc::new(ProverConn::new(
        register.public_key.clone(),
        register.name.clone(),
        out_tx,
    ));
    conns.add(conn.clone());
    metrics::CONNECTED_PROVERS_GAUGE.inc();
    log::info!(
        "prover registered, name {} public_key {}",
        register.name,
        register.public_key
    );

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(frame)) if frame.is_binary() || frame.is_text() => {
                        let msg = InboundMsg {
                            public_key: register.public_key.clone(),
                            payload: frame.as_bytes().to_vec(),
                        };
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(frame)) if frame.is_close() => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("prover {} socket error: {e}", register.public_key);
                        break;
                    }
                    None => break,
                }
            }
            out = out_rx.recv() => {
                let Some(msg) = out else { break };
                let raw = match msg.to_json() {
                    Ok(raw) => raw,
                    Err(e) => {
                        log::error!("could not encode frame for prover {}: {e:?}", register.public_key);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::binary(raw)).await {
                    log::warn!("could not write to prover {}: {e}", register.public_key);
                    break;
                }
            }
        }
    }

    conn.mark_closed();
    conns.remove(&conn);
    metrics::CONNECTED_PROVERS_GAUGE.dec();
    log::info!("prover disconnected, public_key {}", register.public_key);
}

/// The handshake: the first frame on a fresh socket must be `Register`.
async fn read_register(
    ws_rx: &mut (impl StreamExt<Item = Result<Message, warp::Error>> + Unpin),
) -> Option<RegisterMsg> {
    let frame = match ws_rx.next().await {
        Some(Ok(frame)) if frame.is_binary() || frame.is_text() => frame,
        _ => return None,
    };
    let msg = match Msg::from_json(frame.as_bytes()) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("undecodable handshake frame: {e:?}");
            return None;
        }
    };
    if msg.msg_type != MsgType::Register {
        log::warn!("expected register frame, got {:?}", msg.msg_type);
        return None;
    }
    match msg.decode_payload::<RegisterMsg>() {
        Ok(register) if !register.public_key.is_empty() => Some(register),
        Ok(_) => {
            log::warn!("register frame without a public key");
            None
        }
        Err(e) => {
            log::warn!("undecodable register payload: {e:?}");
            None
        }
    }
}
