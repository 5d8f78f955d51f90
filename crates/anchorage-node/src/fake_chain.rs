//! In-memory data source over a mined test chain.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Transaction, Txid};
use jsonrpsee::core::client::Error as RpcError;

use anchorage_bitcoin_client::{BitcoinClientError, BitcoinDataSource, BlockInfo};
use anchorage_prover::test_utils::TestChain;

fn not_found(what: impl std::fmt::Display) -> BitcoinClientError {
    BitcoinClientError::RpcClient(RpcError::Custom(format!("{what} not found")))
}

#[derive(Debug, Clone, Default)]
pub struct FakeChain {
    chain: TestChain,
    transactions: BTreeMap<usize, Vec<Transaction>>,
}

impl FakeChain {
    pub fn new(chain: TestChain) -> Self {
        Self {
            chain,
            transactions: BTreeMap::new(),
        }
    }

    pub fn chain(&self) -> &TestChain {
        &self.chain
    }

    pub fn extend(&mut self, count: usize) {
        self.chain.extend(count);
    }

    /// Mine a block holding `transactions` and return its height
    pub fn push_transactions(&mut self, transactions: Vec<Transaction>) -> usize {
        self.chain.push_block_with_transactions(&transactions);
        let height = self.chain.tip_height();
        self.transactions.insert(height, transactions);
        height
    }

    fn height_of(&self, hash: &BlockHash) -> Option<usize> {
        (0..=self.chain.tip_height()).find(|h| self.chain.hash(*h) == *hash)
    }

    fn find_transaction(&self, txid: &Txid) -> Option<(usize, &Transaction)> {
        self.transactions.iter().find_map(|(height, txs)| {
            txs.iter()
                .find(|tx| tx.compute_txid() == *txid)
                .map(|tx| (*height, tx))
        })
    }

    fn header_at(&self, height: u64) -> Result<BlockHeader, BitcoinClientError> {
        if height > self.chain.tip_height() as u64 {
            return Err(not_found(format!("block #{height}")));
        }
        Ok(*self.chain.header(height as usize))
    }
}

#[async_trait]
impl BitcoinDataSource for FakeChain {
    async fn get_block_hash(&self, height: u64) -> Result<BlockHash, BitcoinClientError> {
        self.header_at(height)?;
        Ok(self.chain.hash(height as usize))
    }

    async fn get_raw_block_header(
        &self,
        hash: &BlockHash,
    ) -> Result<Vec<u8>, BitcoinClientError> {
        let height = self.height_of(hash).ok_or_else(|| not_found(hash))?;
        Ok(self.chain.raw(height))
    }

    async fn get_raw_headers(&self, start: u64, end: u64) -> Result<Vec<u8>, BitcoinClientError> {
        if start > end || end > self.chain.tip_height() as u64 {
            return Err(BitcoinClientError::InvalidRange { start, end });
        }
        Ok(self.chain.raw_range(start as usize..=end as usize))
    }

    async fn get_raw_transaction(
        &self,
        txid: &Txid,
        _block_hash: Option<BlockHash>,
    ) -> Result<Vec<u8>, BitcoinClientError> {
        let (_, tx) = self.find_transaction(txid).ok_or_else(|| not_found(txid))?;
        Ok(bitcoin::consensus::encode::serialize(tx))
    }

    async fn get_transaction_block_hash(
        &self,
        txid: &Txid,
    ) -> Result<Option<BlockHash>, BitcoinClientError> {
        Ok(self
            .find_transaction(txid)
            .map(|(height, _)| self.chain.hash(height)))
    }

    async fn get_block_info(&self, hash: &BlockHash) -> Result<BlockInfo, BitcoinClientError> {
        let height = self.height_of(hash).ok_or_else(|| not_found(hash))?;
        Ok(BlockInfo {
            hash: *hash,
            height: height as u64,
            time: self.chain.header(height).time,
            txids: self
                .transactions
                .get(&height)
                .map(|txs| txs.iter().map(Transaction::compute_txid).collect())
                .unwrap_or_default(),
            confirmations: (self.chain.tip_height() - height + 1) as i32,
        })
    }

    async fn get_block_confirmations(&self, hash: &BlockHash) -> Result<i32, BitcoinClientError> {
        Ok(match self.height_of(hash) {
            Some(height) => (self.chain.tip_height() - height + 1) as i32,
            None => -1,
        })
    }

    async fn get_best_block_height(&self) -> Result<u64, BitcoinClientError> {
        Ok(self.chain.tip_height() as u64)
    }

    /// Never resolves when the chain is too short, the chain does not grow by itself
    async fn wait_block_header(
        &mut self,
        height: u64,
        lag: u64,
    ) -> Result<(BlockHeader, BlockHash), BitcoinClientError> {
        if (self.chain.tip_height() as u64) < height + lag {
            std::future::pending::<()>().await;
        }
        Ok((self.header_at(height)?, self.chain.hash(height as usize)))
    }
}
