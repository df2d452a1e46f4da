//! Shared per-subchain bookkeeping composed into both
//! [`super::deterministic::DeterministicSubaccount`] and
//! [`super::paymentcode::PaymentCodeSubaccount`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

use super::element::{Element, Subchain};

/// Bookkeeping for one subchain: the element map plus the three counters
/// the gap-limit invariants are phrased over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubchainState {
    pub elements: BTreeMap<u32, Element>,
    /// Next index `generate` will assign.
    pub generated_index: u32,
    /// Smallest index not yet proven `Used`.
    pub used_index: u32,
    pub scan_progress: u64,
}

/// The two active subchains of one Subaccount, plus its identity.
///
/// Carries no behavior of its own beyond the invariant-preserving
/// accessors below; `DeterministicSubaccount`/`PaymentCodeSubaccount` hold
/// one of these behind their own mutex and add key-derivation on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubaccountState {
    pub subaccount_id: String,
    pub chains: BTreeMap<Subchain, SubchainState>,
    /// Set once a runtime invariant violation is detected (a stored
    /// public key that doesn't match its decrypted private key). Every
    /// mutating call checks this first and refuses to proceed.
    pub poisoned: bool,
}

impl SubaccountState {
    pub fn new(subaccount_id: impl Into<String>, subchains: &[Subchain]) -> Self {
        let mut chains = BTreeMap::new();
        for &sc in subchains {
            chains.insert(sc, SubchainState::default());
        }
        Self {
            subaccount_id: subaccount_id.into(),
            chains,
            poisoned: false,
        }
    }

    fn chain(&self, subchain: Subchain) -> Result<&SubchainState> {
        self.chains
            .get(&subchain)
            .ok_or_else(|| Error::out_of_range(format!("subchain {subchain:?} not active here")))
    }

    fn chain_mut(&mut self, subchain: Subchain) -> Result<&mut SubchainState> {
        self.chains
            .get_mut(&subchain)
            .ok_or_else(|| Error::out_of_range(format!("subchain {subchain:?} not active here")))
    }

    pub fn check_not_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::key_derivation(format!(
                "subaccount {} is poisoned (stored key invariant violated)",
                self.subaccount_id
            )));
        }
        Ok(())
    }

    pub fn balance_element(&self, subchain: Subchain, index: u32) -> Result<&Element> {
        self.chain(subchain)?
            .elements
            .get(&index)
            .ok_or_else(|| Error::out_of_range(format!("no element at index {index}")))
    }

    pub fn last_generated(&self, subchain: Subchain) -> Result<Option<u32>> {
        let chain = self.chain(subchain)?;
        Ok(chain.generated_index.checked_sub(1))
    }

    pub fn floor(&self, subchain: Subchain) -> Result<Option<u32>> {
        let chain = self.chain(subchain)?;
        if chain.used_index == 0 && chain.elements.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chain.used_index))
        }
    }

    pub fn scan_progress(&self, subchain: Subchain) -> Result<u64> {
        Ok(self.chain(subchain)?.scan_progress)
    }

    pub fn set_scan_progress(&mut self, subchain: Subchain, progress: u64) -> Result<()> {
        self.chain_mut(subchain)?.scan_progress = progress;
        Ok(())
    }

    pub fn insert_element(&mut self, subchain: Subchain, element: Element) -> Result<()> {
        let chain = self.chain_mut(subchain)?;
        chain.elements.insert(element.index, element);
        Ok(())
    }

    /// Record a confirmed txid on `index`. Walks `used_index` forward as
    /// far as the confirmed run reaches; never retreats (confirmations
    /// can arrive out of order).
    pub fn confirm(&mut self, subchain: Subchain, index: u32, txid: impl Into<String>) -> Result<()> {
        let chain = self.chain_mut(subchain)?;
        let element = chain
            .elements
            .get_mut(&index)
            .ok_or_else(|| Error::out_of_range(format!("no element at index {index}")))?;
        element.confirmed_txids.insert(txid.into());
        element.unconfirmed_txids.clear();

        while chain
            .elements
            .get(&chain.used_index)
            .map(|e| e.is_used())
            .unwrap_or(false)
        {
            chain.used_index += 1;
        }
        Ok(())
    }

    /// Remove a txid's confirmation. If the element now has zero
    /// confirmations, `used_index` is lowered to `min(used_index, index)`
    /// (reorgs can unconfirm an element below the current floor).
    pub fn unconfirm(&mut self, subchain: Subchain, index: u32, txid: &str) -> Result<()> {
        let chain = self.chain_mut(subchain)?;
        let element = chain
            .elements
            .get_mut(&index)
            .ok_or_else(|| Error::out_of_range(format!("no element at index {index}")))?;
        element.confirmed_txids.remove(txid);

        if !element.is_used() {
            chain.used_index = chain.used_index.min(index);
        }
        Ok(())
    }

    pub fn element_mut(&mut self, subchain: Subchain, index: u32) -> Result<&mut Element> {
        self.chain_mut(subchain)?
            .elements
            .get_mut(&index)
            .ok_or_else(|| Error::out_of_range(format!("no element at index {index}")))
    }

    pub fn generated_index(&self, subchain: Subchain) -> Result<u32> {
        Ok(self.chain(subchain)?.generated_index)
    }

    pub fn used_index(&self, subchain: Subchain) -> Result<u32> {
        Ok(self.chain(subchain)?.used_index)
    }

    pub fn bump_generated(&mut self, subchain: Subchain) -> Result<()> {
        self.chain_mut(subchain)?.generated_index += 1;
        Ok(())
    }

    /// Release a reservation without marking the element used — used on
    /// abort paths that claimed a key but never broadcast it.
    pub fn release(&mut self, subchain: Subchain, index: u32) -> Result<()> {
        if let Ok(element) = self.element_mut(subchain, index) {
            element.reserved_at = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SubaccountState {
        SubaccountState::new("acct1", &[Subchain::External, Subchain::Internal])
    }

    #[test]
    fn test_floor_none_when_empty() {
        assert_eq!(state().floor(Subchain::External).unwrap(), None);
    }

    #[test]
    fn test_confirm_advances_used_index_through_run() {
        let mut s = state();
        for i in 0..3 {
            s.insert_element(
                Subchain::External,
                Element::new("acct1", Subchain::External, i, [1u8; 33], [0u8; 20]),
            )
            .unwrap();
            s.chains.get_mut(&Subchain::External).unwrap().generated_index = 3;
        }
        s.confirm(Subchain::External, 1, "tx1").unwrap();
        assert_eq!(s.used_index(Subchain::External).unwrap(), 0);

        s.confirm(Subchain::External, 0, "tx0").unwrap();
        assert_eq!(s.used_index(Subchain::External).unwrap(), 2);
    }

    #[test]
    fn test_unconfirm_lowers_used_index() {
        let mut s = state();
        s.insert_element(
            Subchain::External,
            Element::new("acct1", Subchain::External, 0, [1u8; 33], [0u8; 20]),
        )
        .unwrap();
        s.confirm(Subchain::External, 0, "tx0").unwrap();
        assert_eq!(s.used_index(Subchain::External).unwrap(), 1);

        s.unconfirm(Subchain::External, 0, "tx0").unwrap();
        assert_eq!(s.used_index(Subchain::External).unwrap(), 0);
    }

    #[test]
    fn test_unknown_subchain_is_out_of_range() {
        let err = state().balance_element(Subchain::Outgoing, 0).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
    }

    #[test]
    fn test_poisoned_check() {
        let mut s = state();
        assert!(s.check_not_poisoned().is_ok());
        s.poisoned = true;
        assert!(s.check_not_poisoned().is_err());
    }
}
