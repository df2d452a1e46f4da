//! `Element`: one key slot inside a Subaccount's subchain.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Which subchain an [`Element`] belongs to. Deterministic subaccounts use
/// `External`/`Internal`; payment-code subaccounts use `Outgoing`/
/// `Incoming`. `Notification` tags the BIP47 notification output itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subchain {
    External,
    Internal,
    Outgoing,
    Incoming,
    Notification,
}

/// A single `(subaccount, subchain, index)` key slot.
///
/// Invariant: `encrypted_private`, when decrypted, yields a key whose
/// public component is byte-identical to `public_key`. That invariant is
/// enforced at write time by whoever constructs the `Element` (the
/// Deterministic/PaymentCode subaccount), not by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub subaccount_id: String,
    pub subchain: Subchain,
    pub index: u32,
    pub public_key: [u8; 33],
    pub pubkey_hash: [u8; 20],
    /// Ciphertext of the private scalar, encrypted under the process
    /// `MasterSecret`. Absent for watch-only elements.
    pub encrypted_private: Option<Vec<u8>>,
    pub contact_id: Option<String>,
    pub label: Option<String>,
    /// Unix timestamp of the most recent `reserve` call that claimed this
    /// element, or `None` if it has never been reserved.
    pub reserved_at: Option<i64>,
    pub confirmed_txids: BTreeSet<String>,
    pub unconfirmed_txids: BTreeSet<String>,
}

impl Element {
    pub fn new(
        subaccount_id: impl Into<String>,
        subchain: Subchain,
        index: u32,
        public_key: [u8; 33],
        pubkey_hash: [u8; 20],
    ) -> Self {
        Self {
            subaccount_id: subaccount_id.into(),
            subchain,
            index,
            public_key,
            pubkey_hash,
            encrypted_private: None,
            contact_id: None,
            label: None,
            reserved_at: None,
            confirmed_txids: BTreeSet::new(),
            unconfirmed_txids: BTreeSet::new(),
        }
    }

    pub fn is_used(&self) -> bool {
        !self.confirmed_txids.is_empty()
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    /// True once this element has seen at least one broadcast (confirmed
    /// or not) for it.
    pub fn has_broadcast(&self) -> bool {
        !self.confirmed_txids.is_empty() || !self.unconfirmed_txids.is_empty()
    }
}

/// How a candidate index classifies during a gap-limit reservation scan.
/// Replaces the original's "throw to signal try-next-candidate" control
/// flow with a plain `match`able enum (see design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Never touched: free to hand out.
    NeverUsed,
    /// Was reserved, but the reservation expired without a broadcast, or
    /// the same contact/label is asking again — safe to recycle.
    Reissue,
    /// Has a confirmed transaction — permanently spoken for.
    Used,
    /// Currently reserved for a different contact/label than requested.
    MetadataConflict,
    /// Currently reserved (unexpired) and no contact/label was supplied
    /// to disambiguate.
    Reserved,
    /// Has unconfirmed, unspent broadcasts but no confirmation and no
    /// live reservation — a fallback candidate if nothing better appears.
    StaleUnconfirmed,
}

/// Classify an existing element for the reservation scan.
///
/// `requested_contact`/`requested_label`, when both present, let a
/// repeat caller reclaim their own still-live reservation instead of
/// bouncing off it as a conflict (see DESIGN.md's resolution of the
/// "Reserved vs. Reissue" open question).
pub fn classify(
    element: &Element,
    requested_contact: Option<&str>,
    requested_label: Option<&str>,
    now: i64,
    reservation_ttl_secs: i64,
) -> CandidateOutcome {
    if element.is_used() {
        return CandidateOutcome::Used;
    }

    if let Some(reserved_at) = element.reserved_at {
        let expired = now.saturating_sub(reserved_at) >= reservation_ttl_secs;
        let broadcast = element.has_broadcast();

        if !expired {
            let same_owner = requested_contact.is_some()
                && requested_contact == element.contact_id.as_deref()
                && requested_label == element.label.as_deref();
            return if same_owner {
                CandidateOutcome::Reissue
            } else if requested_contact.is_some() {
                CandidateOutcome::MetadataConflict
            } else {
                CandidateOutcome::Reserved
            };
        }

        if !broadcast {
            return CandidateOutcome::Reissue;
        }
        return CandidateOutcome::StaleUnconfirmed;
    }

    if element.has_broadcast() {
        return CandidateOutcome::StaleUnconfirmed;
    }

    CandidateOutcome::NeverUsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem() -> Element {
        Element::new("sub1", Subchain::External, 0, [2u8; 33], [0u8; 20])
    }

    #[test]
    fn test_never_used_classification() {
        assert_eq!(classify(&elem(), None, None, 1000, 3600), CandidateOutcome::NeverUsed);
    }

    #[test]
    fn test_used_classification_ignores_reservation() {
        let mut e = elem();
        e.confirmed_txids.insert("tx1".into());
        e.reserved_at = Some(999);
        assert_eq!(classify(&e, None, None, 1000, 3600), CandidateOutcome::Used);
    }

    #[test]
    fn test_reserved_unexpired_no_contact_is_reserved() {
        let mut e = elem();
        e.reserved_at = Some(990);
        assert_eq!(classify(&e, None, None, 1000, 3600), CandidateOutcome::Reserved);
    }

    #[test]
    fn test_metadata_conflict_when_contact_differs() {
        let mut e = elem();
        e.reserved_at = Some(990);
        e.contact_id = Some("alice".into());
        assert_eq!(
            classify(&e, Some("bob"), None, 1000, 3600),
            CandidateOutcome::MetadataConflict
        );
    }

    #[test]
    fn test_reissue_when_same_contact_requests_again() {
        let mut e = elem();
        e.reserved_at = Some(990);
        e.contact_id = Some("alice".into());
        assert_eq!(
            classify(&e, Some("alice"), None, 1000, 3600),
            CandidateOutcome::Reissue
        );
    }

    #[test]
    fn test_reissue_when_reservation_expired_and_silent() {
        let mut e = elem();
        e.reserved_at = Some(0);
        assert_eq!(classify(&e, None, None, 10_000, 3600), CandidateOutcome::Reissue);
    }

    #[test]
    fn test_stale_unconfirmed_when_expired_with_broadcast() {
        let mut e = elem();
        e.reserved_at = Some(0);
        e.unconfirmed_txids.insert("tx1".into());
        assert_eq!(
            classify(&e, None, None, 10_000, 3600),
            CandidateOutcome::StaleUnconfirmed
        );
    }

    #[test]
    fn test_stale_unconfirmed_without_reservation() {
        let mut e = elem();
        e.unconfirmed_txids.insert("tx1".into());
        assert_eq!(classify(&e, None, None, 1000, 3600), CandidateOutcome::StaleUnconfirmed);
    }
}
