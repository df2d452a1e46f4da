//! Transaction construction: turns a [`proposal::SpendProposal`] plus an
//! externally-fed UTXO set into a signed transaction.

pub mod builder;
pub mod proposal;
pub mod script;
pub mod signer;

pub use builder::{PreparedTx, TransactionBuilder};
pub use proposal::{
    ChainFamily, NotificationRequest, ProposedOutput, ScriptTemplate, SpendProposal, Utxo, UtxoOwner,
};
pub use script::ScriptKind;
pub use signer::SignedTransaction;
