//! Deposit bookkeeping for acknowledged transaction outputs.

use bitcoin::{Address, Amount, Network, Txid};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ack::{ConsumerError, TransactionConsumer};
use crate::proof::TransactionProof;

/// Output credited by an acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub tx_hash: Txid,
    pub output_index: u32,
    pub value: Amount,
    /// Rendered for the configured network, `None` for non-standard scripts
    pub address: Option<String>,
    pub aux_data: Vec<u8>,
}

/// Consumer that records each acknowledged output as a deposit.
#[derive(Debug, Clone)]
pub struct DepositCollector {
    network: Network,
    deposits: Vec<Deposit>,
}

impl DepositCollector {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            deposits: vec![],
        }
    }

    pub fn deposits(&self) -> &[Deposit] {
        &self.deposits
    }

    pub fn take_deposits(&mut self) -> Vec<Deposit> {
        std::mem::take(&mut self.deposits)
    }
}

impl TransactionConsumer for DepositCollector {
    fn on_transaction(
        &mut self,
        proof: &TransactionProof,
        aux_data: &[u8],
    ) -> Result<(), ConsumerError> {
        let output = proof
            .transaction
            .outputs
            .get(proof.output_index as usize)
            .ok_or_else(|| {
                ConsumerError(format!("output {} does not exist", proof.output_index))
            })?;
        let address = Address::from_script(&output.script_pubkey, self.network)
            .ok()
            .map(|address| address.to_string());
        info!(
            "Deposit of {} to {} from {}:{}",
            output.value,
            address.as_deref().unwrap_or("non-standard script"),
            proof.tx_hash(),
            proof.output_index
        );
        self.deposits.push(Deposit {
            tx_hash: proof.tx_hash(),
            output_index: proof.output_index,
            value: output.value,
            address,
            aux_data: aux_data.to_vec(),
        });
        Ok(())
    }
}
