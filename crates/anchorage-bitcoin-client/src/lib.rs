//! Bitcoin RPC data source: raw headers, transactions and block contents with retry logic.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::Decodable;
use bitcoin::{BlockHash, Txid};
use bitcoincore_rpc_json::{GetBlockHeaderResult, GetBlockResult};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Error types for Bitcoin RPC client operations
#[derive(Error, Debug)]
pub enum BitcoinClientError {
    /// RPC client errors
    #[error("RPC client error: {0}")]
    RpcClient(#[from] jsonrpsee::core::client::Error),
    /// Invalid HTTP header value
    #[error("Invalid HTTP header value")]
    InvalidHeader,
    /// Failed to decode hex response
    #[error("Failed to decode hex response: {0}")]
    HexDecode(#[from] hex::FromHexError),
    /// Failed to deserialize Bitcoin consensus data
    #[error("Failed to deserialize Bitcoin data: {0}")]
    BitcoinDeserialization(#[from] bitcoin::consensus::encode::Error),
    #[error("Invalid block range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },
}

/// Default HTTP request timeout
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default best height update interval
pub const BLOCK_COUNT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Block contents needed to build merkle branches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub height: u64,
    pub time: u32,
    /// Transaction ids in block order
    pub txids: Vec<Txid>,
    /// Negative when the block is not on the active chain
    pub confirmations: i32,
}

impl From<GetBlockResult> for BlockInfo {
    fn from(block: GetBlockResult) -> Self {
        Self {
            hash: block.hash,
            height: block.height as u64,
            time: block.time as u32,
            txids: block.tx,
            confirmations: block.confirmations,
        }
    }
}

/// Subset of the verbose `getrawtransaction` answer
#[derive(Debug, Deserialize)]
struct TransactionLocation {
    blockhash: Option<BlockHash>,
}

/// Chain data the relayer and the proof collector read from a full node.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait BitcoinDataSource: Send + Sync {
    async fn get_block_hash(&self, height: u64) -> Result<BlockHash, BitcoinClientError>;

    /// 80-byte consensus serialization of the header
    async fn get_raw_block_header(&self, hash: &BlockHash)
        -> Result<Vec<u8>, BitcoinClientError>;

    /// Concatenated raw headers for heights `start..=end`
    async fn get_raw_headers(&self, start: u64, end: u64) -> Result<Vec<u8>, BitcoinClientError>;

    /// Consensus serialization including witnesses
    async fn get_raw_transaction(
        &self,
        txid: &Txid,
        block_hash: Option<BlockHash>,
    ) -> Result<Vec<u8>, BitcoinClientError>;

    /// Containing block, `None` while unconfirmed
    async fn get_transaction_block_hash(
        &self,
        txid: &Txid,
    ) -> Result<Option<BlockHash>, BitcoinClientError>;

    async fn get_block_info(&self, hash: &BlockHash) -> Result<BlockInfo, BitcoinClientError>;

    async fn get_block_confirmations(&self, hash: &BlockHash) -> Result<i32, BitcoinClientError>;

    async fn get_best_block_height(&self) -> Result<u64, BitcoinClientError>;

    /// Wait until `lag` blocks are built on top of `height`.
    async fn wait_block_header(
        &mut self,
        height: u64,
        lag: u64,
    ) -> Result<(BlockHeader, BlockHash), BitcoinClientError>;
}

/// Bitcoin RPC client
pub struct BitcoinClient {
    client: HttpClient,
    best_height: u64,
    backoff: backoff::ExponentialBackoff,
    poll_interval: Duration,
}

impl BitcoinClient {
    /// Create a new Bitcoin RPC client with default retry settings (exponential backoff)
    pub fn new(url: String, userpwd: Option<String>) -> Result<Self, BitcoinClientError> {
        let mut headers = HeaderMap::new();
        if let Some(userpwd) = userpwd {
            let creds = general_purpose::STANDARD.encode(userpwd);
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Basic {creds}"))
                    .map_err(|_| BitcoinClientError::InvalidHeader)?,
            );
        };

        let client = HttpClient::builder()
            .set_headers(headers)
            .request_timeout(HTTP_REQUEST_TIMEOUT)
            .build(url)?;

        Ok(Self {
            client,
            best_height: 0,
            backoff: backoff::ExponentialBackoff::default(),
            poll_interval: BLOCK_COUNT_UPDATE_INTERVAL,
        })
    }

    pub fn with_backoff(mut self, backoff: backoff::ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn request_decode<T: Decodable>(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<T, BitcoinClientError> {
        let res_bytes = self.request_bytes(method, params).await?;
        bitcoin::consensus::deserialize(&res_bytes).map_err(Into::into)
    }

    async fn request_bytes(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<Vec<u8>, BitcoinClientError> {
        request_with_retry(self.backoff.clone(), || async {
            let res_hex: String = self.client.request(method, params.clone()).await?;
            hex::decode(&res_hex).map_err(Into::into)
        })
        .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<T, BitcoinClientError> {
        request_with_retry(self.backoff.clone(), || async {
            self.client
                .request(method, params.clone())
                .await
                .map_err(Into::into)
        })
        .await
    }

    /// Get block header by hash
    pub async fn get_block_header(
        &self,
        hash: &BlockHash,
    ) -> Result<BlockHeader, BitcoinClientError> {
        self.request_decode("getblockheader", rpc_params![hash.to_string(), false])
            .await
    }

    /// Get block header by height
    pub async fn get_block_header_by_height(
        &self,
        height: u64,
    ) -> Result<(BlockHeader, BlockHash), BitcoinClientError> {
        let hash = self.get_block_hash(height).await?;
        let header = self.get_block_header(&hash).await?;
        Ok((header, hash))
    }
}

#[async_trait]
impl BitcoinDataSource for BitcoinClient {
    async fn get_block_hash(&self, height: u64) -> Result<BlockHash, BitcoinClientError> {
        self.request("getblockhash", rpc_params![height]).await
    }

    async fn get_raw_block_header(
        &self,
        hash: &BlockHash,
    ) -> Result<Vec<u8>, BitcoinClientError> {
        self.request_bytes("getblockheader", rpc_params![hash.to_string(), false])
            .await
    }

    async fn get_raw_headers(&self, start: u64, end: u64) -> Result<Vec<u8>, BitcoinClientError> {
        if start > end {
            return Err(BitcoinClientError::InvalidRange { start, end });
        }
        let mut raw = Vec::with_capacity(((end - start + 1) * 80) as usize);
        for height in start..=end {
            let hash = self.get_block_hash(height).await?;
            raw.extend(self.get_raw_block_header(&hash).await?);
        }
        debug!("Fetched headers {}..={}", start, end);
        Ok(raw)
    }

    async fn get_raw_transaction(
        &self,
        txid: &Txid,
        block_hash: Option<BlockHash>,
    ) -> Result<Vec<u8>, BitcoinClientError> {
        let params = match block_hash {
            Some(block_hash) => rpc_params![txid.to_string(), false, block_hash.to_string()],
            None => rpc_params![txid.to_string(), false],
        };
        self.request_bytes("getrawtransaction", params).await
    }

    async fn get_transaction_block_hash(
        &self,
        txid: &Txid,
    ) -> Result<Option<BlockHash>, BitcoinClientError> {
        let location: TransactionLocation = self
            .request("getrawtransaction", rpc_params![txid.to_string(), true])
            .await?;
        Ok(location.blockhash)
    }

    async fn get_block_info(&self, hash: &BlockHash) -> Result<BlockInfo, BitcoinClientError> {
        let block: GetBlockResult = self
            .request("getblock", rpc_params![hash.to_string(), 1])
            .await?;
        Ok(block.into())
    }

    async fn get_block_confirmations(&self, hash: &BlockHash) -> Result<i32, BitcoinClientError> {
        let header: GetBlockHeaderResult = self
            .request("getblockheader", rpc_params![hash.to_string(), true])
            .await?;
        Ok(header.confirmations)
    }

    async fn get_best_block_height(&self) -> Result<u64, BitcoinClientError> {
        self.request("getblockcount", rpc_params![]).await
    }

    async fn wait_block_header(
        &mut self,
        height: u64,
        lag: u64,
    ) -> Result<(BlockHeader, BlockHash), BitcoinClientError> {
        while height >= self.best_height {
            self.best_height = (self.get_best_block_height().await? + 1).saturating_sub(lag);
            if height < self.best_height {
                debug!("New block count: {}", self.best_height);
                break;
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        self.get_block_header_by_height(height).await
    }
}

/// Execute a request with retry logic using exponential backoff
/// Only retries on unexpected HTTP errors (not 200 OK or 400 Bad Request)
async fn request_with_retry<F, Fut, T>(
    backoff: backoff::ExponentialBackoff,
    operation: F,
) -> Result<T, BitcoinClientError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, BitcoinClientError>>,
{
    use backoff::{future::retry_notify, Error};

    retry_notify(
        backoff,
        || async {
            match operation().await {
                Ok(result) => Ok(result),
                Err(err) if is_retryable_error(&err) => Err(Error::transient(err)),
                Err(err) => Err(Error::permanent(err)),
            }
        },
        |err, duration| {
            info!("Request failed, retrying in {:?}: {}", duration, err);
        },
    )
    .await
}

/// Transport failures and timeouts are retried; node answers and decoding errors are final
fn is_retryable_error(err: &BitcoinClientError) -> bool {
    use jsonrpsee::core::client::Error as RpcError;
    matches!(
        err,
        BitcoinClientError::RpcClient(
            RpcError::Transport(_)
                | RpcError::RequestTimeout
                | RpcError::RestartNeeded(_)
                | RpcError::ServiceDisconnect
        )
    )
}
