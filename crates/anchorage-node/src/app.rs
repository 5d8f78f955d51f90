//! Application server owning the prover and its store, driven by async message passing.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info};

use anchorage_bitcoin_client::BitcoinClient;
use anchorage_prover::{
    AckKey, AnchorBlock, AnchorUpdated, BitcoinProver, Deposit, DepositCollector, EnclaveSigner,
    FullComputationsProof, ProverConfig, ProverError, ProvingRequest, TransactionAcknowledged,
};

use crate::event_sink::EventSink;
use crate::ledger_state::load_prover;
use crate::store::{AppStore, LedgerStore};

/// Request sent to the application server via the API channel
pub struct ApiRequest {
    /// The body of the API request containing the specific operation
    pub body: ApiRequestBody,
    /// Channel to send the response back to the caller
    pub tx_response: oneshot::Sender<ApiResponse>,
}

pub type ApiResponse = Result<ApiResponseBody, anyhow::Error>;

/// Possible request operations that can be sent to the application server
pub enum ApiRequestBody {
    /// Get the index and record of the current anchor
    GetLastAnchor(),
    /// Get a committed anchor by index
    GetAnchor(u64),
    /// Get the latest committed anchor strictly below the given block height
    GetAnchorBelow(u64),
    /// Run a proving action and sign the result
    Compute(ProvingRequest),
    /// Commit an anchor proof
    AckAnchorBlock(FullComputationsProof),
    /// Acknowledge a transaction proof with auxiliary data
    AckTransaction(FullComputationsProof, Vec<u8>),
    /// Get the confirmations the prover currently requires
    GetMinConfirmations(),
    /// Change the confirmations the prover requires
    SetMinConfirmations(u32),
}

/// Response body for API requests containing the result data
pub enum ApiResponseBody {
    GetLastAnchor(u64, AnchorBlock),
    GetAnchor(Option<AnchorBlock>),
    GetAnchorBelow(Option<(u64, AnchorBlock)>),
    Compute(FullComputationsProof),
    AckAnchorBlock(AnchorUpdated),
    AckTransaction(TransactionAcknowledged, Vec<Deposit>),
    GetMinConfirmations(u32),
    SetMinConfirmations(),
}

/// Where the computation unit's secret key comes from
#[derive(Debug, Clone)]
pub enum SignerKey {
    Hex(String),
    SealedFile(PathBuf),
}

impl SignerKey {
    pub fn load(&self) -> Result<EnclaveSigner, ProverError> {
        match self {
            SignerKey::Hex(secret) => EnclaveSigner::from_hex(secret),
            SignerKey::SealedFile(path) => EnclaveSigner::from_sealed_file(path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the database storing anchors and acknowledgements
    pub db_path: PathBuf,
    /// Path to the JSON lines file receiving prover events
    pub events_path: PathBuf,
    /// Api requests channel capacity
    pub api_requests_capacity: usize,
    /// Bitcoin RPC URL used to fetch the seed block
    pub bitcoin_rpc_url: String,
    /// Bitcoin RPC user:password (optional)
    pub bitcoin_rpc_userpwd: Option<String>,
    pub prover: ProverConfig,
    pub signer_key: SignerKey,
    /// Height of the seed anchor used when the store is empty
    pub seed_height: u64,
}

/// Prover, store and sinks the server mutates while handling requests
pub struct AppState {
    prover: BitcoinProver<EnclaveSigner>,
    store: Arc<dyn LedgerStore>,
    deposits: DepositCollector,
    sink: EventSink,
}

impl AppState {
    pub fn new(
        prover: BitcoinProver<EnclaveSigner>,
        store: Arc<dyn LedgerStore>,
        sink: EventSink,
    ) -> Self {
        let deposits = DepositCollector::new(prover.network());
        Self {
            prover,
            store,
            deposits,
            sink,
        }
    }

    /// Handle one request; the outer error means the state can no longer be trusted.
    async fn handle(&mut self, body: ApiRequestBody) -> Result<ApiResponse, anyhow::Error> {
        let res = match body {
            ApiRequestBody::GetLastAnchor() => Ok(ApiResponseBody::GetLastAnchor(
                self.prover.last_anchor_index(),
                self.prover.last_anchor().clone(),
            )),
            ApiRequestBody::GetAnchor(index) => Ok(ApiResponseBody::GetAnchor(
                self.prover.anchor(index).cloned(),
            )),
            ApiRequestBody::GetAnchorBelow(height) => {
                let anchor = self
                    .prover
                    .ledger()
                    .anchors()
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, anchor)| anchor.anchor_block_number < height)
                    .map(|(index, anchor)| (index as u64, anchor.clone()));
                Ok(ApiResponseBody::GetAnchorBelow(anchor))
            }
            ApiRequestBody::Compute(request) => self
                .prover
                .compute_request(&request)
                .map(ApiResponseBody::Compute)
                .map_err(Into::into),
            ApiRequestBody::AckAnchorBlock(proof) => self.ack_anchor_block(&proof).await,
            ApiRequestBody::AckTransaction(proof, aux_data) => {
                self.ack_transaction(&proof, &aux_data).await?
            }
            ApiRequestBody::GetMinConfirmations() => Ok(ApiResponseBody::GetMinConfirmations(
                self.prover.min_confirmations(),
            )),
            ApiRequestBody::SetMinConfirmations(min_confirmations) => self
                .prover
                .set_min_confirmations(min_confirmations)
                .map(|()| ApiResponseBody::SetMinConfirmations())
                .map_err(Into::into),
        };
        self.sink.write_events(&self.prover.drain_events()).await?;
        Ok(res)
    }

    /// Stage, persist, then apply; a failed write leaves the in-memory ledger untouched.
    async fn ack_anchor_block(&mut self, proof: &FullComputationsProof) -> ApiResponse {
        let pending = self.prover.stage_anchor_block(proof)?;
        self.store.add_anchor(pending.index(), pending.anchor()).await?;
        let event = self.prover.apply_anchor_block(pending)?;
        Ok(ApiResponseBody::AckAnchorBlock(event))
    }

    async fn ack_transaction(
        &mut self,
        proof: &FullComputationsProof,
        aux_data: &[u8],
    ) -> Result<ApiResponse, anyhow::Error> {
        let event = match self
            .prover
            .ack_transaction(proof, &mut self.deposits, aux_data)
        {
            Ok(event) => event,
            Err(err) => return Ok(Err(err.into())),
        };
        let key = AckKey {
            tx_hash: event.tx_hash,
            use_tag: event.use_tag,
        };
        // Memory is already ahead of disk here, so failing to persist is fatal
        self.store.add_acknowledgement(&key).await?;
        let deposits = self.deposits.take_deposits();
        Ok(Ok(ApiResponseBody::AckTransaction(event, deposits)))
    }
}

/// The main application server that processes API requests sequentially
pub struct AppServer {
    config: AppConfig,
    rx_requests: mpsc::Receiver<ApiRequest>,
    rx_shutdown: broadcast::Receiver<()>,
}

/// Client for communicating with the application server via async channels
#[derive(Clone)]
pub struct AppClient {
    tx_requests: mpsc::Sender<ApiRequest>,
}

impl AppServer {
    pub fn new(
        config: AppConfig,
        rx_requests: mpsc::Receiver<ApiRequest>,
        rx_shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            rx_requests,
            rx_shutdown,
        }
    }

    async fn run_inner(&mut self) -> Result<(), anyhow::Error> {
        info!("App server started");

        let store = Arc::new(AppStore::single_atomic_writer(&self.config.db_path).await?);
        let bitcoin_client = BitcoinClient::new(
            self.config.bitcoin_rpc_url.clone(),
            self.config.bitcoin_rpc_userpwd.clone(),
        )?;
        let signer = self.config.signer_key.load()?;
        let prover = load_prover(
            store.as_ref(),
            &bitcoin_client,
            self.config.prover.clone(),
            self.config.seed_height,
            signer,
        )
        .await?;
        let sink = EventSink::new(self.config.events_path.clone()).await?;

        self.serve(AppState::new(prover, store, sink)).await
    }

    /// Process requests until shutdown or a fatal error
    pub async fn serve(&mut self, mut state: AppState) -> Result<(), anyhow::Error> {
        loop {
            tokio::select! {
                Some(req) = self.rx_requests.recv() => {
                    let res = state.handle(req.body).await?;
                    req.tx_response
                        .send(res)
                        .map_err(|_| anyhow::anyhow!("Failed to send response to API request"))?;
                },
                _ = self.rx_shutdown.recv() => {
                    return Ok(())
                }
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("App server exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("App server terminated");
                Ok(())
            }
        }
    }
}

impl AppClient {
    pub fn new(tx_requests: mpsc::Sender<ApiRequest>) -> Self {
        Self { tx_requests }
    }

    /// Helper method to send a request and handle the response
    async fn send_request<T>(
        &self,
        body: ApiRequestBody,
        extract_response: impl FnOnce(ApiResponseBody) -> Option<T>,
    ) -> Result<T, anyhow::Error> {
        let (tx_response, rx_response) = oneshot::channel();
        self.tx_requests
            .send(ApiRequest { body, tx_response })
            .await
            .map_err(|_| anyhow::anyhow!("App server is not running"))?;

        let res = rx_response
            .await
            .map_err(|_| anyhow::anyhow!("Failed to receive response"))?;

        match res {
            Ok(response_body) => extract_response(response_body)
                .ok_or_else(|| anyhow::anyhow!("Unexpected response type")),
            Err(err) => Err(err),
        }
    }

    pub async fn get_last_anchor(&self) -> Result<(u64, AnchorBlock), anyhow::Error> {
        self.send_request(ApiRequestBody::GetLastAnchor(), |response| match response {
            ApiResponseBody::GetLastAnchor(index, anchor) => Some((index, anchor)),
            _ => None,
        })
        .await
    }

    pub async fn get_anchor(&self, index: u64) -> Result<Option<AnchorBlock>, anyhow::Error> {
        self.send_request(ApiRequestBody::GetAnchor(index), |response| match response {
            ApiResponseBody::GetAnchor(anchor) => Some(anchor),
            _ => None,
        })
        .await
    }

    pub async fn get_anchor_below(
        &self,
        height: u64,
    ) -> Result<Option<(u64, AnchorBlock)>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::GetAnchorBelow(height),
            |response| match response {
                ApiResponseBody::GetAnchorBelow(anchor) => Some(anchor),
                _ => None,
            },
        )
        .await
    }

    pub async fn compute(
        &self,
        request: ProvingRequest,
    ) -> Result<FullComputationsProof, anyhow::Error> {
        self.send_request(ApiRequestBody::Compute(request), |response| match response {
            ApiResponseBody::Compute(proof) => Some(proof),
            _ => None,
        })
        .await
    }

    pub async fn ack_anchor_block(
        &self,
        proof: FullComputationsProof,
    ) -> Result<AnchorUpdated, anyhow::Error> {
        self.send_request(
            ApiRequestBody::AckAnchorBlock(proof),
            |response| match response {
                ApiResponseBody::AckAnchorBlock(event) => Some(event),
                _ => None,
            },
        )
        .await
    }

    pub async fn ack_transaction(
        &self,
        proof: FullComputationsProof,
        aux_data: Vec<u8>,
    ) -> Result<(TransactionAcknowledged, Vec<Deposit>), anyhow::Error> {
        self.send_request(
            ApiRequestBody::AckTransaction(proof, aux_data),
            |response| match response {
                ApiResponseBody::AckTransaction(event, deposits) => Some((event, deposits)),
                _ => None,
            },
        )
        .await
    }

    pub async fn get_min_confirmations(&self) -> Result<u32, anyhow::Error> {
        self.send_request(
            ApiRequestBody::GetMinConfirmations(),
            |response| match response {
                ApiResponseBody::GetMinConfirmations(min_confirmations) => Some(min_confirmations),
                _ => None,
            },
        )
        .await
    }

    pub async fn set_min_confirmations(&self, min_confirmations: u32) -> Result<(), anyhow::Error> {
        self.send_request(
            ApiRequestBody::SetMinConfirmations(min_confirmations),
            |response| match response {
                ApiResponseBody::SetMinConfirmations() => Some(()),
                _ => None,
            },
        )
        .await
    }
}

/// Create app server and client
pub fn create_app(
    config: AppConfig,
    rx_shutdown: broadcast::Receiver<()>,
) -> (AppServer, AppClient) {
    let (tx_requests, rx_requests) = mpsc::channel(config.api_requests_capacity);
    let server = AppServer::new(config, rx_requests, rx_shutdown);
    let client = AppClient::new(tx_requests);
    (server, client)
}
