//! Read-only introspection RPC for operators, exposed under the `roller`
//! namespace: `roller_listSessions` and `roller_listFailedSessions`.

use jsonrpsee::{
    core::RpcResult,
    proc_macros::rpc,
    server::{Server, ServerHandle},
};
use std::sync::Arc;

use crate::manager::{FailedSessionInfo, Manager, SessionInfo};

#[rpc(server, namespace = "roller")]
pub trait RollerDebugApi {
    /// List all active proof generation sessions.
    #[method(name = "listSessions")]
    async fn list_sessions(&self) -> RpcResult<Vec<SessionInfo>>;

    /// List sessions that ended in a non-verified terminal state.
    #[method(name = "listFailedSessions")]
    async fn list_failed_sessions(&self) -> RpcResult<Vec<FailedSessionInfo>>;
}

pub struct RollerDebugRpc {
    manager: Arc<Manager>,
}

impl RollerDebugRpc {
    pub fn new(manager: Arc<Manager>) -> Self {
        RollerDebugRpc { manager }
    }
}

#[async_trait::async_trait]
impl RollerDebugApiServer for RollerDebugRpc {
    async fn list_sessions(&self) -> RpcResult<Vec<SessionInfo>> {
        Ok(self.manager.list_sessions().await)
    }

    async fn list_failed_sessions(&self) -> RpcResult<Vec<FailedSessionInfo>> {
        Ok(self.manager.list_failed_sessions())
    }
}

pub async fn start_debug_api(addr: &str, manager: Arc<Manager>) -> anyhow::Result<ServerHandle> {
    let server = Server::builder().build(addr).await?;
    let handle = server.start(RollerDebugRpc::new(manager).into_rpc());
    log::info!("debug api listening on {addr}");
    Ok(handle)
}
