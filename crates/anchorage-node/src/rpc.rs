//! HTTP RPC server exposing anchors, transaction proofs and acknowledgments.

use std::{path::PathBuf, str::FromStr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use anchorage_prover::{AnchorBlock, Deposit, FullComputationsProof, ProverError, TransactionAcknowledged};

use crate::{
    app::AppClient,
    collector::{CollectorError, ProofCollector},
    store::{AppStore, LedgerStore},
};

/// Query parameters for transaction proof generation
#[derive(Debug, Deserialize)]
pub struct TransactionProofQuery {
    pub output_index: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnchorResponse {
    pub index: u64,
    pub anchor: AnchorBlock,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcknowledgeRequest {
    pub proof: FullComputationsProof,
    /// Hex encoded data handed to the transaction consumer
    #[serde(default)]
    pub aux_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcknowledgeResponse {
    pub event: TransactionAcknowledged,
    pub deposits: Vec<Deposit>,
}

/// Configuration for the RPC server
#[derive(Clone)]
pub struct RpcConfig {
    /// Host and port binding for the RPC server (e.g., "127.0.0.1:5000")
    pub rpc_host: String,
    /// Path to the database storing anchors and acknowledgements
    pub db_path: PathBuf,
}

/// HTTP RPC server reading committed state from the store and routing writes to the app server
pub struct RpcServer {
    config: RpcConfig,
    app_client: AppClient,
    collector: ProofCollector,
    rx_shutdown: broadcast::Receiver<()>,
}

#[derive(Clone)]
pub struct RpcState {
    store: Arc<AppStore>,
    app_client: AppClient,
    collector: ProofCollector,
}

impl RpcState {
    pub fn new(config: &RpcConfig, app_client: AppClient, collector: ProofCollector) -> Self {
        Self {
            store: Arc::new(AppStore::multiple_concurrent_readers(&config.db_path)),
            app_client,
            collector,
        }
    }
}

impl RpcServer {
    pub fn new(
        config: RpcConfig,
        app_client: AppClient,
        collector: ProofCollector,
        rx_shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            app_client,
            collector,
            rx_shutdown,
        }
    }

    async fn run_inner(&self) -> Result<(), std::io::Error> {
        info!("Starting RPC server on {}", self.config.rpc_host);

        let state = RpcState::new(&self.config, self.app_client.clone(), self.collector.clone());

        let app = Router::new()
            .route("/anchor", get(get_last_anchor))
            .route("/anchor/:index", get(get_anchor))
            .route("/transaction-proof/:tx_id", get(get_transaction_proof))
            .route("/acknowledge", post(acknowledge_transaction))
            .with_state(state)
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.config.rpc_host).await?;
        let mut rx_shutdown = self.rx_shutdown.resubscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { rx_shutdown.recv().await.unwrap_or_default() })
            .await
    }

    pub async fn run(&self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("RPC server exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("RPC server terminated");
                Ok(())
            }
        }
    }
}

/// Status code for an error coming back from the app server
fn prover_status(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<ProverError>() {
        Some(ProverError::MalformedInput(_)) => StatusCode::BAD_REQUEST,
        Some(ProverError::SignatureInvalid | ProverError::QuorumNotMet { .. }) => {
            StatusCode::FORBIDDEN
        }
        Some(
            ProverError::TooFewConfirmations { .. } | ProverError::AlreadyAcknowledged { .. },
        ) => StatusCode::CONFLICT,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn collector_status(err: &CollectorError) -> StatusCode {
    match err {
        CollectorError::Unconfirmed(_) | CollectorError::MissingFromBlock(_) => {
            StatusCode::NOT_FOUND
        }
        CollectorError::Stale(_)
        | CollectorError::NotAnchored(_)
        | CollectorError::Immature { .. } => StatusCode::CONFLICT,
        CollectorError::Source(_) => StatusCode::BAD_GATEWAY,
        CollectorError::Prover(err) => prover_status(err),
    }
}

/// Get the latest committed anchor
///
/// # Returns
/// * `Json<AnchorResponse>` - The anchor index and record
/// * `StatusCode::NOT_FOUND` - If the ledger has not been seeded yet
/// * `StatusCode::INTERNAL_SERVER_ERROR` - If reading the store fails
pub async fn get_last_anchor(
    State(state): State<RpcState>,
) -> Result<Json<AnchorResponse>, StatusCode> {
    let (index, anchor) = state
        .store
        .get_last_anchor()
        .await
        .map_err(|e| {
            error!("Failed to get last anchor: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(AnchorResponse { index, anchor }))
}

/// Get a committed anchor by index
pub async fn get_anchor(
    State(state): State<RpcState>,
    Path(index): Path<u64>,
) -> Result<Json<AnchorBlock>, StatusCode> {
    let anchor = state
        .store
        .get_anchor(index)
        .await
        .map_err(|e| {
            error!("Failed to get anchor #{}: {}", index, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(anchor))
}

/// Build a signed transaction proof for one output of a confirmed transaction
///
/// # Arguments
/// * `tx_id` - The transaction id
/// * `output_index` - The output to prove (default 0)
///
/// # Returns
/// * `Json<FullComputationsProof>` - The signed proof, ready to be acknowledged
/// * `StatusCode::BAD_REQUEST` - If the transaction ID is invalid
/// * `StatusCode::NOT_FOUND` - If the transaction is not confirmed
/// * `StatusCode::CONFLICT` - If the block is not yet provable, retry later
pub async fn get_transaction_proof(
    State(state): State<RpcState>,
    Path(tx_id): Path<String>,
    Query(query): Query<TransactionProofQuery>,
) -> Result<Json<FullComputationsProof>, StatusCode> {
    let txid = Txid::from_str(&tx_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let output_index = query.output_index.unwrap_or(0);
    let proof = state
        .collector
        .prove_transaction(txid, output_index)
        .await
        .map_err(|e| {
            let status = collector_status(&e);
            if status.is_server_error() {
                error!("Failed to prove transaction {}:{}: {}", txid, output_index, e);
            } else {
                warn!("Transaction {}:{} is not provable: {}", txid, output_index, e);
            }
            status
        })?;
    Ok(Json(proof))
}

/// Acknowledge a transaction proof exactly once
///
/// # Returns
/// * `Json<AcknowledgeResponse>` - The acknowledgment event and credited deposits
/// * `StatusCode::BAD_REQUEST` - If the auxiliary data is not hex
/// * `StatusCode::CONFLICT` - If the output was already acknowledged
pub async fn acknowledge_transaction(
    State(state): State<RpcState>,
    Json(request): Json<AcknowledgeRequest>,
) -> Result<Json<AcknowledgeResponse>, StatusCode> {
    let aux_data = hex::decode(&request.aux_data).map_err(|_| StatusCode::BAD_REQUEST)?;
    let (event, deposits) = state
        .app_client
        .ack_transaction(request.proof, aux_data)
        .await
        .map_err(|e| {
            let status = prover_status(&e);
            if status.is_server_error() {
                error!("Failed to acknowledge transaction: {}", e);
            } else {
                warn!("Acknowledgment rejected: {}", e);
            }
            status
        })?;
    Ok(Json(AcknowledgeResponse { event, deposits }))
}
