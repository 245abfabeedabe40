use async_trait::async_trait;
use common::message::ProofMsg;
use std::time::Duration;
use tonic::Request;

use crate::database::Task;
use crate::proto::verifier::v1::{
    verifier_service_client::VerifierServiceClient, VerifyProofRequest,
};

const VERIFY_TIMEOUT_SECS: u64 = 300;

/// Stateless proof verification. `Err` means the proof could not be
/// evaluated; `Ok(false)` means it is definitively invalid.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(&self, task: &Task, proof: &ProofMsg) -> anyhow::Result<bool>;
}

/// gRPC client for an external verifier process.
pub struct RpcVerifier {
    endpoint: String,
}

impl RpcVerifier {
    pub fn new(endpoint: &str) -> Self {
        RpcVerifier {
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl ProofVerifier for RpcVerifier {
    async fn verify(&self, task: &Task, proof: &ProofMsg) -> anyhow::Result<bool> {
        let mut client = VerifierServiceClient::connect(self.endpoint.clone()).await?;
        let request = VerifyProofRequest {
            task_id: task.id,
            traces: task.traces.clone(),
            proof: proof.proof.clone(),
            final_pair: proof.final_pair.clone(),
        };
        log::info!("[verify] rpc {} start", task.id);
        let mut grpc_request = Request::new(request);
        grpc_request.set_timeout(Duration::from_secs(VERIFY_TIMEOUT_SECS));
        let response = client.verify_proof(grpc_request).await?;
        log::info!(
            "[verify] rpc {} valid:{} end",
            task.id,
            response.get_ref().valid
        );
        Ok(response.get_ref().valid)
    }
}
