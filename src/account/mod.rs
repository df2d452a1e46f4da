//! The account subsystem: subchains of keys ("Elements") grouped into
//! Subaccounts, grouped into an Account per nym/chain, looked up process-
//! wide through an [`AccountIndex`].

pub mod deterministic;
pub mod element;
pub mod paymentcode;
pub mod subaccount;

pub use deterministic::DeterministicSubaccount;
pub use element::{classify, CandidateOutcome, Element, Subchain};
pub use paymentcode::{PaymentCode, PaymentCodeSubaccount};
pub use subaccount::{SubaccountState, SubchainState};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::{Error, Result};
use crate::secret::PasswordPrompt;

/// A handle to any of this crate's concrete Subaccount kinds, held by
/// [`AccountIndex`] and by [`crate::txbuilder`] when it needs to pull a
/// change key or release a reservation.
#[derive(Clone)]
pub enum SubaccountHandle {
    Deterministic(Arc<DeterministicSubaccount>),
    PaymentCode(Arc<PaymentCodeSubaccount>),
}

impl SubaccountHandle {
    pub fn subaccount_id(&self) -> String {
        match self {
            SubaccountHandle::Deterministic(s) => s
                .balance_element(Subchain::External, 0)
                .map(|e| e.subaccount_id)
                .unwrap_or_default(),
            SubaccountHandle::PaymentCode(s) => s.subaccount_id(),
        }
    }

    /// Pull the private key backing a previously-derived element, used by
    /// [`crate::txbuilder::signer`] to sign a spend.
    pub async fn private_key(
        &self,
        subchain: Subchain,
        index: u32,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<[u8; 32]> {
        match self {
            SubaccountHandle::Deterministic(s) => s.private_key(subchain, index, prompt, reason).await,
            SubaccountHandle::PaymentCode(s) => s.private_key(subchain, index, prompt, reason).await,
        }
    }

    /// Release a reservation claimed on this handle's behalf, used by
    /// [`crate::txbuilder::builder`]'s abort path. Payment-code channels
    /// track no reservation state of their own (their elements are
    /// derived, not reserved — see [`PaymentCodeSubaccount`]), so this is
    /// a no-op for that variant.
    pub async fn release(&self, subchain: Subchain, index: u32) -> Result<()> {
        match self {
            SubaccountHandle::Deterministic(s) => s.release(subchain, index).await,
            SubaccountHandle::PaymentCode(_) => Ok(()),
        }
    }
}

/// Process-wide `subaccount_id -> Subaccount` lookup.
///
/// Holds one mutex, taken only during insert/lookup — never across a
/// Subaccount's own operations, so a long-running `reserve` on one
/// Subaccount never blocks a lookup of another.
#[derive(Default)]
pub struct AccountIndex {
    subaccounts: Mutex<HashMap<String, Arc<SubaccountHandle>>>,
}

impl AccountIndex {
    pub fn new() -> Self {
        Self {
            subaccounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: impl Into<String>, handle: SubaccountHandle) {
        self.subaccounts.lock().unwrap().insert(id.into(), Arc::new(handle));
    }

    pub fn get(&self, id: &str) -> Result<Arc<SubaccountHandle>> {
        self.subaccounts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::out_of_range(format!("no subaccount with id {id}")))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SubaccountHandle>> {
        self.subaccounts.lock().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.subaccounts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_missing_subaccount_is_out_of_range() {
        let index = AccountIndex::new();
        let err = index.get("does-not-exist").unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
    }

    #[test]
    fn test_insert_and_remove() {
        let index = AccountIndex::new();
        assert!(index.is_empty());
    }
}
