//! Deterministic-HD account subsystem.
//!
//! Covers BIP32/BIP39 key derivation, gap-limit-aware lookahead
//! bookkeeping for deterministic subaccounts, BIP47 payment-code
//! channels, GCS compact filters, and a UTXO-selection/fee-aware
//! transaction builder — the shared core embedded by whatever process
//! owns the storage backend, network collaborator, and password prompt.

pub mod account;
pub mod bip32;
pub mod bip39;
pub mod common;
pub mod gcs;
pub mod secret;
pub mod seed;
pub mod storage;
pub mod txbuilder;
pub mod types;

pub use account::{
    AccountIndex, CandidateOutcome, DeterministicSubaccount, Element, PaymentCode, PaymentCodeSubaccount,
    Subchain, SubaccountHandle, SubaccountState, SubchainState,
};
pub use bip32::{Curve, ExtendedKey, HDPath};
pub use common::{Config, ConfigError, Error, Network, Result};
pub use gcs::GCSFilter;
pub use secret::{MasterSecret, NullPrompt, PasswordPrompt, Secret};
pub use storage::{MemoryBackend, SqliteBackend, StorageBackend, StorageError};
pub use txbuilder::{
    ChainFamily, PreparedTx, ScriptTemplate, SignedTransaction, SpendProposal, TransactionBuilder, Utxo,
    UtxoOwner,
};
