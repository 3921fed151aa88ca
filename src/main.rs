use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use utxo_ledger::{
    config, crypto, metrics, storage,
    utxo::{format_amount, parse_amount},
    zakat::{self, ZakatOutcome},
    BlockRef, Ledger, LedgerError, MinedBlock, TransferRequest, DEFAULT_LOG_LIMIT,
};

#[derive(Parser)]
#[command(author, version, about = "UTXO ledger with proof-of-work block assembly")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Generate a fresh Ed25519 keypair and print its wallet id
    Keygen,
    /// Register the wallet of the key in LEDGER_SECRET_KEY (or a given public key)
    Register {
        #[arg(long)]
        user: String,
        /// Hex public key; defaults to the key of the local secret
        #[arg(long)]
        public_key: Option<String>,
    },
    /// Credit a wallet from the faucet
    Fund {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        amount: String,
    },
    /// Sign and queue a transfer from the local wallet
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: String,
        #[arg(long, default_value = "")]
        note: String,
    },
    Balance {
        #[arg(long)]
        wallet: String,
    },
    Utxos {
        #[arg(long)]
        wallet: String,
    },
    /// Mine one block over the pending pool
    Mine {
        #[arg(long)]
        miner: String,
    },
    Blocks,
    /// Show one block by index or hash
    Block { id: String },
    /// Transactions touching a wallet, newest first
    History {
        #[arg(long)]
        wallet: String,
        #[arg(long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
    },
    /// Transactions waiting for the next block
    Pending,
    /// System events (registrations, funding, blocks, zakat), newest first
    Logs {
        #[arg(long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
    },
    /// Queue zakat deductions for one wallet, or for all of them
    Zakat {
        #[arg(long)]
        wallet: Option<String>,
    },
    Report {
        #[arg(long)]
        wallet: String,
    },
    /// Re-check linkage, hashes and Merkle roots of the stored chain
    Validate,
    /// Mine on an interval, run the zakat scheduler and expose metrics until Ctrl-C
    Serve {
        #[arg(long)]
        miner: String,
    },
}

fn load_config(path: &str) -> anyhow::Result<config::Config> {
    match config::load(path) {
        Ok(c) => Ok(c),
        Err(e1) => {
            eprintln!("⚠️  Could not read config from '{}': {:#}; using built-in defaults", path, e1);
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            config::load_from_str(EMBEDDED_CONFIG)
                .map_err(|e2| anyhow::anyhow!("failed to load configuration: {} / {}", e1, e2))
        }
    }
}

async fn mine_once(ledger: Arc<Ledger>, miner: String) -> anyhow::Result<MinedBlock> {
    if ledger.mining_config().offload_blocking {
        let mined = tokio::task::spawn_blocking(move || ledger.mine_pending(&miner))
            .await
            .context("mining task panicked")??;
        Ok(mined)
    } else {
        Ok(ledger.mine_pending(&miner)?)
    }
}

fn print_mined(m: &MinedBlock) {
    println!(
        "⛏️  Mined block #{} {} (nonce {}, {} attempts)",
        m.block.index, m.block.hash, m.block.nonce, m.attempts
    );
    println!("   ✅ confirmed: {}   ⏭️  dropped: {}", m.confirmed.len(), m.dropped.len());
    for d in &m.dropped {
        println!("   ⏭️  {} {:?}", d.tx_id, d.reason);
    }
}

fn spawn_miner(
    ledger: Arc<Ledger>,
    miner: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let every = Duration::from_secs(ledger.mining_config().interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    println!("🛑 Miner received shutdown signal");
                    return;
                }
                _ = ticker.tick() => {
                    match mine_once(ledger.clone(), miner.clone()).await {
                        Ok(m) => print_mined(&m),
                        Err(e) => match e.downcast_ref::<LedgerError>() {
                            Some(LedgerError::PowExhausted(_)) => warn!("mining gave up: {e}"),
                            _ => error!("mining failed: {e:#}"),
                        },
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Cmd::Keygen = cli.cmd {
        let sk = crypto::generate_keypair();
        let pk = sk.verifying_key();
        println!("🔑 Secret key: {}", hex::encode(sk.to_bytes()));
        println!("📫 Public key: {}", hex::encode(pk.as_bytes()));
        println!("👛 Wallet id:  {}", crypto::wallet_id_from_pk(&pk));
        println!("   Export the secret as LEDGER_SECRET_KEY to sign transfers.");
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;
    let store = storage::open(&cfg.storage)?;
    let stats = store.get_stats()?;
    println!(
        "🗄️  Database opened at '{}': {} blocks, {} unspent outputs, {} pending",
        cfg.storage.path, stats.block_count, stats.owner_index_count, stats.pending_count
    );
    let ledger = Arc::new(Ledger::new(store.clone(), cfg.mining.clone(), cfg.zakat.clone()));

    match cli.cmd {
        Cmd::Keygen => unreachable!("handled before the store is opened"),
        Cmd::Register { user, public_key } => {
            let pk = match public_key {
                Some(hex_pk) => crypto::verifying_key_from_hex(&hex_pk)?,
                None => crypto::secret_key_from_env_or_prompt(Some("Secret key (hex): "))?.verifying_key(),
            };
            let wallet = ledger.register_wallet(&user, &pk)?;
            println!("👛 Registered wallet {} for '{}'", wallet.id, wallet.user_id);
        }
        Cmd::Fund { wallet, amount } => {
            let tx = ledger.fund(&wallet, parse_amount(&amount)?)?;
            println!("🚰 Funded {} with {} ({})", wallet, format_amount(tx.amount), tx.id);
        }
        Cmd::Send { to, amount, note } => {
            let sk = crypto::secret_key_from_env_or_prompt(Some("Secret key (hex): "))?;
            let sender = crypto::wallet_id_from_pk(&sk.verifying_key());
            let req = TransferRequest { receiver: to, amount: parse_amount(&amount)?, note };
            let tx = ledger.submit_transfer(&sender, &sk, req)?;
            println!("📤 Queued {} → {}: {} (tx {})", tx.sender, tx.receiver, format_amount(tx.amount), tx.id);
            println!("   Balances change when the next block is mined.");
        }
        Cmd::Balance { wallet } => {
            println!("💰 {}: {}", wallet, format_amount(ledger.balance(&wallet)?));
        }
        Cmd::Utxos { wallet } => {
            let utxos = ledger.list_utxos(&wallet)?;
            if utxos.is_empty() {
                println!("No unspent outputs for {}", wallet);
            }
            for u in utxos {
                println!("🪙 {}  {}", u.id, format_amount(u.amount));
            }
        }
        Cmd::Mine { miner } => {
            let mined = mine_once(ledger.clone(), miner).await?;
            print_mined(&mined);
        }
        Cmd::Blocks => {
            let blocks = ledger.list_blocks()?;
            println!("{}", serde_json::to_string_pretty(&blocks)?);
        }
        Cmd::Block { id } => {
            let r: BlockRef = id.parse()?;
            println!("{}", serde_json::to_string_pretty(&ledger.get_block(&r)?)?);
        }
        Cmd::History { wallet, limit } => {
            let txs = ledger.history(&wallet, limit)?;
            println!("{}", serde_json::to_string_pretty(&txs)?);
        }
        Cmd::Pending => {
            println!("{}", serde_json::to_string_pretty(&ledger.pending()?)?);
        }
        Cmd::Logs { limit } => {
            for e in ledger.system_logs(limit)? {
                println!("📜 {}  {:?}  {}", e.timestamp.to_rfc3339(), e.event, e.details);
            }
        }
        Cmd::Zakat { wallet } => match wallet {
            Some(w) => match zakat::run_for_wallet(&ledger, &w)? {
                ZakatOutcome::Queued(tx) => {
                    println!("🕌 Queued zakat of {} from {} (tx {})", format_amount(tx.amount), w, tx.id)
                }
                ZakatOutcome::NotDue(reason) => println!("⏭️  No zakat due for {}: {}", w, reason),
            },
            None => {
                let n = zakat::run_all(&ledger)?;
                println!("🕌 Queued {} zakat deductions", n);
            }
        },
        Cmd::Report { wallet } => {
            let r = ledger.report(&wallet)?;
            println!("📊 Report for {}", r.wallet);
            println!("   sent:     {} in {} transactions", format_amount(r.total_sent), r.sent_count);
            println!("   received: {} in {} transactions", format_amount(r.total_received), r.received_count);
            println!("   zakat:    {} in {} deductions", format_amount(r.zakat_deducted), r.zakat_count);
        }
        Cmd::Validate => {
            let n = ledger.validate_chain()?;
            println!("✅ Chain of {} blocks is consistent", n);
        }
        Cmd::Serve { miner } => {
            let (shutdown_tx, _) = broadcast::channel::<()>(1);
            metrics::serve(cfg.metrics.clone())?;
            let miner_task = spawn_miner(ledger.clone(), miner, shutdown_tx.subscribe());
            let zakat_task = cfg.zakat.enabled.then(|| zakat::spawn(ledger.clone(), shutdown_tx.subscribe()));
            println!("🚀 Serving; mining every {}s. Press Ctrl-C to stop.", cfg.mining.interval_secs);

            signal::ctrl_c().await?;
            println!("\n🛑 Ctrl-C received, shutting down...");
            let _ = shutdown_tx.send(());
            let _ = miner_task.await;
            if let Some(t) = zakat_task {
                let _ = t.await;
            }
            store.close()?;
            println!("👋 Stopped.");
        }
    }

    Ok(())
}
