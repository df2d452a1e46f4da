//! Demo CLI exercising the account subsystem end to end: generates a
//! mnemonic, opens a deterministic subaccount, reserves a receive
//! address, and walks a spend proposal through the transaction builder
//! against a synthetic UTXO.
//!
//! Run modes:
//!   cargo run              - full walkthrough against an in-memory backend
//!   cargo run -- help      - usage

use std::env;
use std::sync::Arc;

use rand::RngCore;

use zbtc_core::{
    bip32::{self, HDPath},
    bip39::{self, Language, SeedStyle},
    common::{init_from_config, Config},
    secret::{MasterSecret, NullPrompt},
    seed::SeedStore,
    storage::MemoryBackend,
    txbuilder::{
        ChainFamily, ProposedOutput, ScriptTemplate, SpendProposal, TransactionBuilder, Utxo, UtxoOwner,
    },
    DeterministicSubaccount, Subchain,
};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.get(1).map(String::as_str) == Some("help") {
        print_usage();
        return;
    }

    if let Err(e) = run().await {
        eprintln!("demo failed: {e}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("zbtc-core-demo - account subsystem walkthrough");
    println!();
    println!("Usage:");
    println!("  zbtc-core-demo          Run the full demo");
    println!("  zbtc-core-demo help     Show this message");
    println!();
    println!("Environment variables honored: see src/common/config.rs.");
}

async fn run() -> zbtc_core::Result<()> {
    let config = Config::from_env().unwrap_or_else(|_| Config {
        network: zbtc_core::Network::Devnet,
        gap_limit: 20,
        max_lookahead: 1000,
        storage_path: None,
        log_level: "info".to_string(),
    });
    let _ = init_from_config(&config);

    let prompt = NullPrompt;
    let storage: Arc<dyn zbtc_core::StorageBackend> = Arc::new(MemoryBackend::new());
    let master = Arc::new(MasterSecret::new(storage.clone(), "demo-profile", None));
    let seeds = Arc::new(SeedStore::new(storage.clone()));

    let mut entropy = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut entropy);
    let words = bip39::entropy_to_words(&entropy, Language::English)?.join(" ");
    println!("Generated mnemonic: {words}");

    let secret = master
        .get_secret(&prompt, "create seed")
        .await
        .map_err(|e| zbtc_core::Error::unlock(e.to_string()))?;
    let seed_id = seeds
        .create(&secret, SeedStyle::Bip39, Language::English, &words, "")
        .await?;
    println!("Seed id: {seed_id}");

    let root_path = HDPath::with_indices(&seed_id, vec![bip32::HARDENED + 44, bip32::HARDENED, bip32::HARDENED]);
    let account = Arc::new(
        DeterministicSubaccount::create(
            "demo-account",
            root_path,
            master.clone(),
            seeds.clone(),
            storage.clone(),
            &prompt,
            config.gap_limit,
            config.max_lookahead,
        )
        .await?,
    );

    let receive_indices = account
        .reserve(Subchain::External, 1, &prompt, "receive address", None, None, 0)
        .await?;
    let receive_index = receive_indices[0];
    let receive_element = account.balance_element(Subchain::External, receive_index)?;
    println!(
        "Receive address (index {receive_index}): hash160={}",
        hex::encode(receive_element.pubkey_hash)
    );

    let proposal = SpendProposal {
        initiator_nym_id: "demo-account".to_string(),
        outputs: vec![ProposedOutput {
            target: ScriptTemplate::P2pkh { pubkey_hash: [0x42; 20] },
            amount_sats: 25_000,
            memo: Some("demo payment".to_string()),
            contact_id: None,
        }],
        expires_at: 0,
        notification: None,
    };

    let feerate_sat_per_kvb = 5_000;
    let mut builder = TransactionBuilder::create_outputs(proposal, feerate_sat_per_kvb, &prompt, "build spend").await?;

    let funding_index = receive_index;
    let funding_element = account.balance_element(Subchain::External, funding_index)?;
    let synthetic_outpoint = bitcoin::OutPoint::null();
    let funding_script =
        zbtc_core::txbuilder::script::build_script(&ScriptTemplate::P2pkh { pubkey_hash: funding_element.pubkey_hash })?;
    builder.add_input(Utxo::new(
        synthetic_outpoint,
        funding_script,
        100_000,
        UtxoOwner::Single { subaccount: account.clone(), subchain: Subchain::External, index: funding_index },
    ));

    println!("Funded: {}", builder.is_funded());
    builder
        .add_change(account.clone(), &prompt, "reserve change", 0)
        .await?;

    let signed = builder.finish(ChainFamily::Btc, &prompt, "sign spend").await?;
    println!("Signed txid: {}", signed.txid());
    println!("Fee paid: {} sats", signed.fee_sats);

    Ok(())
}
