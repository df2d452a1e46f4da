//! `TransactionBuilder`: the five-phase construction — CreateOutputs,
//! externally-driven AddInputs, AddChange, BIP69 ordering, then Sign.

use std::sync::Arc;

use bitcoin::{absolute::LockTime, transaction::Version, OutPoint, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::account::{DeterministicSubaccount, Subchain};
use crate::common::{Error, Result};
use crate::secret::PasswordPrompt;

use super::proposal::{ChainFamily, ScriptTemplate, SpendProposal, Utxo, UtxoOwner};
use super::script::build_script;
use super::signer::{self, SignedTransaction};

/// A single change-key reservation made while funding a proposal,
/// released back to its subaccount if the build is abandoned before
/// `sign` completes.
struct ChangeReservation {
    subaccount: Arc<DeterministicSubaccount>,
    subchain: Subchain,
    index: u32,
}

/// Unsigned transaction plus the UTXOs that fund it, in the same order
/// as `tx.input` — the handoff from [`TransactionBuilder::add_change`]
/// to [`signer::sign`].
#[derive(Clone)]
pub struct PreparedTx {
    pub tx: Transaction,
    pub utxos: Vec<Utxo>,
}

/// Drives a [`SpendProposal`] through Phases 1-4; `finish` hands the
/// result to [`signer::sign`] for Phase 5.
///
/// Not `Clone` or `Send`-shared: one builder is owned by whichever
/// caller is assembling a single proposal's transaction.
pub struct TransactionBuilder {
    outputs: Vec<TxOut>,
    inputs: Vec<Utxo>,
    feerate_sat_per_kvb: u64,
    reservations: Vec<ChangeReservation>,
    proposal: SpendProposal,
}

impl TransactionBuilder {
    /// Phase 1 — CreateOutputs. Resolves every `ProposedOutput` in
    /// `proposal` to a concrete script, including deriving the next
    /// address on an outgoing BIP47 channel where applicable.
    pub async fn create_outputs(
        proposal: SpendProposal,
        feerate_sat_per_kvb: u64,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<Self> {
        let mut outputs = Vec::with_capacity(proposal.outputs.len());
        for proposed in &proposal.outputs {
            let script = match &proposed.target {
                ScriptTemplate::PaymentCodeOutgoing { subaccount, remote: _, index } => {
                    let element = subaccount.derive_element(Subchain::Outgoing, *index, prompt, reason).await?;
                    build_script(&ScriptTemplate::P2pkh { pubkey_hash: element.pubkey_hash })?
                }
                other => build_script(other)?,
            };
            outputs.push(TxOut {
                value: bitcoin::Amount::from_sat(proposed.amount_sats),
                script_pubkey: script,
            });
        }

        Ok(Self {
            outputs,
            inputs: Vec::new(),
            feerate_sat_per_kvb,
            reservations: Vec::new(),
            proposal,
        })
    }

    fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value.to_sat()).sum()
    }

    fn input_value(&self) -> u64 {
        self.inputs.iter().map(|u| u.value_sats).sum()
    }

    /// Serialized size, in bytes, of the transaction built so far plus
    /// one P2PKH-sized change output — `required_fee`'s basis.
    fn bytes_with_change_allowance(&self) -> u64 {
        const CHANGE_OUTPUT_BYTES: u64 = 34;
        const INPUT_BYTES: u64 = 148;
        const BASE_BYTES: u64 = 10;
        BASE_BYTES + self.inputs.len() as u64 * INPUT_BYTES + self.outputs.len() as u64 * 34 + CHANGE_OUTPUT_BYTES
    }

    /// `bytes() * feerate / 1000`.
    pub fn required_fee(&self) -> u64 {
        self.bytes_with_change_allowance() * self.feerate_sat_per_kvb / 1000
    }

    /// Phase 2 — AddInputs. The caller feeds UTXOs one at a time; once
    /// [`Self::is_funded`] returns true no further inputs are needed.
    pub fn add_input(&mut self, utxo: Utxo) {
        self.inputs.push(utxo);
    }

    /// `input_value > output_value + required_fee()`.
    pub fn is_funded(&self) -> bool {
        self.input_value() > self.output_value() + self.required_fee()
    }

    /// `148 * feerate / 1000`.
    fn dust_threshold(&self) -> u64 {
        148 * self.feerate_sat_per_kvb / 1000
    }

    /// Phase 3 — AddChange. Reserves a change element on `change_source`'s
    /// Internal subchain, embeds a BIP47 notification payload if the
    /// proposal carries one, and drops the output entirely if the
    /// post-fee excess doesn't clear dust.
    pub async fn add_change(
        &mut self,
        change_source: Arc<DeterministicSubaccount>,
        prompt: &dyn PasswordPrompt,
        reason: &str,
        timestamp: i64,
    ) -> Result<()> {
        if !self.is_funded() {
            return Err(Error::build_funding("cannot add change before the proposal is funded"));
        }

        let fee = self.required_fee();
        let excess = self.input_value() - self.output_value() - fee;
        if excess <= self.dust_threshold() {
            return Ok(());
        }

        let indices = change_source
            .reserve(Subchain::Internal, 1, prompt, reason, None, None, timestamp)
            .await?;
        let index = *indices
            .first()
            .ok_or_else(|| Error::build_funding("change subaccount returned no reservation"))?;
        self.reservations.push(ChangeReservation {
            subaccount: change_source.clone(),
            subchain: Subchain::Internal,
            index,
        });

        let script = if let Some(notification) = &self.proposal.notification {
            let pushes = notification.channel.generate_notification_elements(prompt, reason).await?;
            build_script(&ScriptTemplate::Multisig { m: 1, pubkeys: pushes.to_vec() })?
        } else {
            let element = change_source.balance_element(Subchain::Internal, index)?;
            build_script(&ScriptTemplate::P2pkh { pubkey_hash: element.pubkey_hash })?
        };

        self.outputs.push(TxOut { value: bitcoin::Amount::from_sat(excess), script_pubkey: script });
        Ok(())
    }

    /// Phase 4 — BIP69 canonical ordering: inputs ascending by
    /// `(prev_txid, prev_vout)`, outputs ascending by `(value,
    /// script_bytes_lex)`.
    fn canonical_order(&mut self) {
        self.inputs.sort_by(|a, b| {
            let a_txid = bitcoin::consensus::encode::serialize(&a.outpoint.txid);
            let b_txid = bitcoin::consensus::encode::serialize(&b.outpoint.txid);
            a_txid.cmp(&b_txid).then(a.outpoint.vout.cmp(&b.outpoint.vout))
        });
        self.outputs.sort_by(|a, b| {
            a.value
                .to_sat()
                .cmp(&b.value.to_sat())
                .then(a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
        });
    }

    /// Release every change key reserved by this builder back to its
    /// subaccount.
    pub async fn abort(self) -> Result<()> {
        for reservation in self.reservations {
            reservation.subaccount.release(reservation.subchain, reservation.index).await?;
        }
        Ok(())
    }

    /// Phases 4 and 5: order the transaction, then sign it. Consumes
    /// the builder; on failure, every change key reserved so far is
    /// released before the error is returned.
    pub async fn finish(
        mut self,
        chain: ChainFamily,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<SignedTransaction> {
        if !self.is_funded() {
            let reservations = std::mem::take(&mut self.reservations);
            for r in reservations {
                let _ = r.subaccount.release(r.subchain, r.index).await;
            }
            return Err(Error::build_funding("proposal is not funded"));
        }

        self.canonical_order();

        let tx_in: Vec<TxIn> = self
            .inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_in,
            output: self.outputs.clone(),
        };

        let prepared = PreparedTx { tx, utxos: self.inputs.clone() };
        let reservations = std::mem::take(&mut self.reservations);

        match signer::sign(prepared, chain, prompt, reason).await {
            Ok(signed) => Ok(signed),
            Err(e) => {
                for r in reservations {
                    let _ = r.subaccount.release(r.subchain, r.index).await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txbuilder::proposal::ProposedOutput;

    fn sample_proposal() -> SpendProposal {
        SpendProposal {
            initiator_nym_id: "nym-1".to_string(),
            outputs: vec![ProposedOutput {
                target: ScriptTemplate::P2pkh { pubkey_hash: [1u8; 20] },
                amount_sats: 50_000,
                memo: None,
                contact_id: None,
            }],
            expires_at: 0,
            notification: None,
        }
    }

    #[tokio::test]
    async fn test_not_funded_until_inputs_cover_outputs_and_fee() {
        let builder = TransactionBuilder::create_outputs(sample_proposal(), 10_000, &crate::secret::NullPrompt, "test")
            .await
            .unwrap();
        assert!(!builder.is_funded());
    }

    #[tokio::test]
    async fn test_funded_once_input_exceeds_output_plus_fee() {
        let mut builder =
            TransactionBuilder::create_outputs(sample_proposal(), 10_000, &crate::secret::NullPrompt, "test")
                .await
                .unwrap();
        let required = builder.required_fee();
        builder.add_input(Utxo::new(
            OutPoint::null(),
            bitcoin::ScriptBuf::new(),
            50_000 + required + 1,
            UtxoOwner::Multisig { signers: Vec::new() },
        ));
        assert!(builder.is_funded());
    }
}
