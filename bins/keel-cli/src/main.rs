//! keel — command-line front end for a cosigned 2-of-3 multisig wallet.
//!
//! Talks to the wallet service over HTTP. Credentials and the network come
//! from `~/.config/keel/config.toml` (or `--config`) layered under `KEEL_*`
//! environment variables. Passphrases are always prompted without echo.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bitcoin::Txid;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use keel_client::{ClientConfig, HttpClient};
use keel_core::amount::{to_btc, to_satoshi};
use keel_core::constants::DEFAULT_DISCOVERY_INCREMENT;
use keel_core::traits::{FeeOracle, WalletService};
use keel_core::types::{FeeStrategy, SendRequest};
use keel_wallet::{BackupInfo, CancelFlag, CreateWalletOptions, Credentials, PayOptions, Services, Wallet, WalletSweeper};

/// Cosigned multisig wallet interface.
#[derive(Parser)]
#[command(name = "keel")]
#[command(version, about = "2-of-3 multisig wallet with a remote cosigner.")]
struct Cli {
    /// Client configuration file (default: ~/.config/keel/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and register a new wallet, writing its backup sheet.
    Create(CreateArgs),
    /// Show confirmed and unconfirmed balance.
    Balance(WalletArgs),
    /// Derive a fresh receive (or change) address.
    Address(AddressArgs),
    /// Pay one recipient.
    Pay(PayArgs),
    /// Largest amount a single payment could send.
    MaxSpendable(MaxSpendableArgs),
    /// Current fee rates in satoshi per kB.
    Fees,
    /// Scan the chain for wallet funds.
    Discover(DiscoverArgs),
    /// Recover all funds using only the backup sheet.
    Sweep(SweepArgs),
    /// Lock a wallet UTXO against concurrent spends.
    LockUtxo(UtxoArgs),
    /// Release a UTXO lock.
    UnlockUtxo(UtxoArgs),
    /// Manage the wallet webhook.
    Webhook(WebhookArgs),
    /// Move the wallet to a new cosigning key index.
    UpgradeKeyIndex(UpgradeArgs),
    /// Delete the wallet from the service.
    Delete(DeleteArgs),
}

#[derive(Args)]
struct WalletArgs {
    /// Wallet identifier.
    #[arg(short, long)]
    wallet: String,
}

#[derive(Args)]
struct CreateArgs {
    /// Wallet identifier (random if omitted).
    #[arg(short, long)]
    wallet: Option<String>,

    /// Initial cosigning key index.
    #[arg(long, default_value_t = 0)]
    key_index: u32,

    /// Where to write the backup sheet (default: ~/.keel/<identifier>.backup.json).
    #[arg(short, long)]
    backup: Option<PathBuf>,
}

#[derive(Args)]
struct AddressArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    /// Derive on the change chain.
    #[arg(long)]
    change: bool,
}

#[derive(Args)]
struct PayArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    /// Recipient address.
    #[arg(short, long)]
    to: String,

    /// Amount in BTC (e.g. 0.015).
    #[arg(short, long)]
    amount: String,

    /// optimal, low_priority or fixed:<satoshi>.
    #[arg(long, default_value = "optimal")]
    fee_strategy: FeeStrategy,

    /// Spend unconfirmed outputs.
    #[arg(long)]
    zero_conf: bool,

    /// Hex data for an OP_RETURN output.
    #[arg(long)]
    op_return: Option<String>,

    /// Skip the server-side fee sanity check.
    #[arg(long)]
    no_check_fee: bool,
}

#[derive(Args)]
struct MaxSpendableArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    #[arg(long, default_value = "optimal")]
    fee_strategy: FeeStrategy,

    #[arg(long)]
    zero_conf: bool,
}

#[derive(Args)]
struct DiscoverArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    /// Addresses scanned per batch.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_INCREMENT)]
    gap: u32,
}

#[derive(Args)]
struct SweepArgs {
    /// Backup sheet written by `create`.
    #[arg(short, long)]
    backup: PathBuf,

    /// Address receiving the swept funds.
    #[arg(short, long)]
    destination: String,

    /// Addresses scanned per batch.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_INCREMENT)]
    gap: u32,

    /// Broadcast the signed sweep instead of printing it.
    #[arg(long)]
    broadcast: bool,
}

#[derive(Args)]
struct UtxoArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    #[arg(long)]
    txid: String,

    #[arg(long)]
    vout: u32,

    /// Lock duration in seconds (lock-utxo only).
    #[arg(long)]
    ttl: Option<u64>,
}

#[derive(Args)]
struct WebhookArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    /// Callback URL; omit together with --delete.
    #[arg(long, required_unless_present = "delete")]
    url: Option<String>,

    /// Webhook identifier (default: WALLET-<identifier>).
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    delete: bool,
}

#[derive(Args)]
struct UpgradeArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    #[arg(long)]
    key_index: u32,
}

#[derive(Args)]
struct DeleteArgs {
    #[command(flatten)]
    wallet: WalletArgs,

    /// Delete even if the wallet still holds funds.
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config_path = resolve_config_path(cli.config)?;
    let client = connect(&config_path)?;

    match cli.command {
        Commands::Create(args) => wallet_create(&client, args),
        Commands::Balance(args) => wallet_balance(&client, args),
        Commands::Address(args) => wallet_address(&client, args),
        Commands::Pay(args) => wallet_pay(&client, args),
        Commands::MaxSpendable(args) => wallet_max_spendable(&client, args),
        Commands::Fees => fees(&client),
        Commands::Discover(args) => wallet_discover(&client, args),
        Commands::Sweep(args) => wallet_sweep(&client, args),
        Commands::LockUtxo(args) => utxo_lock(&client, args, true),
        Commands::UnlockUtxo(args) => utxo_lock(&client, args, false),
        Commands::Webhook(args) => wallet_webhook(&client, args),
        Commands::UpgradeKeyIndex(args) => wallet_upgrade(&client, args),
        Commands::Delete(args) => wallet_delete(&client, args),
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Load the client configuration and build the HTTP client.
fn connect(config_path: &Path) -> Result<Arc<HttpClient>> {
    let config = ClientConfig::load(Some(config_path))
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    debug!(?config, "client configuration");
    let client = HttpClient::new(config).context("Failed to build HTTP client")?;
    Ok(Arc::new(client))
}

fn load_wallet(client: &Arc<HttpClient>, identifier: &str) -> Result<Wallet> {
    Wallet::load(Services::from_client(Arc::clone(client)), identifier)
        .with_context(|| format!("Failed to load wallet {identifier}"))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn wallet_create(client: &Arc<HttpClient>, args: CreateArgs) -> Result<()> {
    let network = client.config().bitcoin_network()?;

    let passphrase = prompt_password("Enter wallet passphrase")?;
    let passphrase_confirm = prompt_password("Confirm passphrase")?;
    if passphrase != passphrase_confirm {
        bail!("Passphrases do not match");
    }

    let mut options = CreateWalletOptions::new(passphrase, network).key_index(args.key_index);
    if let Some(identifier) = args.wallet {
        options = options.identifier(identifier);
    }
    let (wallet, backup) =
        Wallet::create(Services::from_client(Arc::clone(client)), options).context("Failed to create wallet")?;

    let backup_path = match args.backup {
        Some(path) => path,
        None => default_backup_path(wallet.identifier())?,
    };
    if backup_path.exists() {
        bail!("Backup file already exists: {}", backup_path.display());
    }
    if let Some(parent) = backup_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(&backup_path, backup.to_json()?)
        .with_context(|| format!("Failed to write backup to {}", backup_path.display()))?;

    println!("\n=== WALLET CREATED ===");
    println!("Identifier: {}", wallet.identifier());
    println!("Network: {network}");
    println!("\n{}", backup.to_text());
    println!("\nBackup saved to: {}", backup_path.display());
    println!("\nWARNING: the backup mnemonic will NOT be shown again.");
    println!("Together with the passphrase it can move all funds without the cosigner.");
    Ok(())
}

fn wallet_balance(client: &Arc<HttpClient>, args: WalletArgs) -> Result<()> {
    let wallet = load_wallet(client, &args.wallet)?;
    let balance = wallet.balance()?;
    println!("Confirmed:   {} BTC", to_btc(balance.confirmed));
    println!("Unconfirmed: {} BTC", to_btc(balance.unconfirmed));
    println!("Total:       {} BTC", to_btc(balance.total()));
    Ok(())
}

fn wallet_address(client: &Arc<HttpClient>, args: AddressArgs) -> Result<()> {
    let mut wallet = load_wallet(client, &args.wallet.wallet)?;
    let address = if args.change { wallet.new_change_address()? } else { wallet.new_address()? };
    let path = wallet.path_for_address(&address)?;
    println!("{address}  {path}");
    Ok(())
}

fn wallet_pay(client: &Arc<HttpClient>, args: PayArgs) -> Result<()> {
    let amount = to_satoshi(&args.amount).context("Invalid amount")?;
    let op_return = args
        .op_return
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("OP_RETURN data must be hex")?;

    let mut wallet = load_wallet(client, &args.wallet.wallet)?;
    let passphrase = prompt_password("Wallet passphrase")?;
    let options = PayOptions {
        allow_zero_conf: args.zero_conf,
        fee_strategy: args.fee_strategy,
        op_return,
        check_fee: !args.no_check_fee,
        ..PayOptions::default()
    };
    let txid = wallet
        .pay_and_lock(Credentials::passphrase(passphrase), [(args.to.as_str(), amount)], options)
        .context("Payment failed")?;

    println!("\n=== TRANSACTION SENT ===");
    println!("TxID: {txid}");
    println!("To: {}", args.to);
    println!("Amount: {} BTC ({amount} sat)", to_btc(amount));
    Ok(())
}

fn wallet_max_spendable(client: &Arc<HttpClient>, args: MaxSpendableArgs) -> Result<()> {
    let mut wallet = load_wallet(client, &args.wallet.wallet)?;
    let max = wallet.max_spendable(args.zero_conf, args.fee_strategy)?;
    println!("Max: {} BTC ({} sat)", to_btc(max.max), max.max);
    println!("Fee: {} sat over {} inputs", max.fee, max.inputs);
    Ok(())
}

fn fees(client: &Arc<HttpClient>) -> Result<()> {
    let rates = client.fee_per_kb().context("Failed to fetch fee rates")?;
    println!("Optimal:      {} sat/kB", rates.optimal);
    println!("Low priority: {} sat/kB", rates.low_priority);
    Ok(())
}

fn wallet_discover(client: &Arc<HttpClient>, args: DiscoverArgs) -> Result<()> {
    let mut wallet = load_wallet(client, &args.wallet.wallet)?;
    let balance = wallet.do_discovery(args.gap, &CancelFlag::new())?;
    println!("Discovered {} UTXOs", wallet.utxo_store().len());
    println!("Confirmed:   {} BTC", to_btc(balance.confirmed));
    println!("Unconfirmed: {} BTC", to_btc(balance.unconfirmed));
    Ok(())
}

fn wallet_sweep(client: &Arc<HttpClient>, args: SweepArgs) -> Result<()> {
    let json = std::fs::read_to_string(&args.backup)
        .with_context(|| format!("Failed to read backup {}", args.backup.display()))?;
    let backup = BackupInfo::from_json(&json).context("Invalid backup sheet")?;
    let passphrase = prompt_password("Wallet passphrase")?;

    let mut sweeper = WalletSweeper::new(backup.sweeper_config(&passphrase), client.as_ref(), client.as_ref())
        .context("Failed to restore keys from backup (check passphrase)")?;
    let found = sweeper.discover_wallet_funds(args.gap, &CancelFlag::new())?;
    println!("Found {} BTC in {} UTXOs", to_btc(found.total()), sweeper.discovered().len());

    let result = sweeper.sweep_wallet(&args.destination).context("Sweep failed")?;
    println!("Inputs: {}  Fee: {} sat  Swept: {} BTC", result.inputs, result.fee, to_btc(result.swept));
    if !result.complete {
        bail!("Sweep transaction is not fully signed ({} signatures)", result.signatures);
    }

    if args.broadcast {
        let request = SendRequest { raw_transaction: result.raw_hex(), paths: Vec::new(), check_fee: true };
        let txid = client.send_transaction(&backup.identifier, &request).context("Broadcast failed")?;
        println!("TxID: {txid}");
    } else {
        println!("{}", result.raw_hex());
    }
    Ok(())
}

fn utxo_lock(client: &Arc<HttpClient>, args: UtxoArgs, lock: bool) -> Result<()> {
    let txid = Txid::from_str(&args.txid).context("Invalid txid")?;
    let mut wallet = load_wallet(client, &args.wallet.wallet)?;
    wallet.refresh_utxos()?;
    if lock {
        let expires_at = wallet.lock_utxo(&txid, args.vout, args.ttl)?;
        println!("Locked {txid}:{} until {expires_at}", args.vout);
    } else {
        let released = wallet.unlock_utxo(&txid, args.vout)?;
        println!("{}", if released { "Unlocked" } else { "Not locked" });
    }
    Ok(())
}

fn wallet_webhook(client: &Arc<HttpClient>, args: WebhookArgs) -> Result<()> {
    let wallet = load_wallet(client, &args.wallet.wallet)?;
    if args.delete {
        let deleted = wallet.delete_webhook(args.id.as_deref())?;
        println!("{}", if deleted { "Webhook deleted" } else { "No such webhook" });
        return Ok(());
    }
    let url = args.url.context("--url is required")?;
    let webhook = wallet.setup_webhook(&url, args.id.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&webhook)?);
    Ok(())
}

fn wallet_upgrade(client: &Arc<HttpClient>, args: UpgradeArgs) -> Result<()> {
    let mut wallet = load_wallet(client, &args.wallet.wallet)?;
    let passphrase = prompt_password("Wallet passphrase")?;
    let mut unlocked = wallet.unlock(Credentials::passphrase(passphrase)).context("Failed to unlock wallet")?;
    unlocked.upgrade_key_index(args.key_index)?;
    println!("Key index is now {}", args.key_index);
    Ok(())
}

fn wallet_delete(client: &Arc<HttpClient>, args: DeleteArgs) -> Result<()> {
    let mut wallet = load_wallet(client, &args.wallet.wallet)?;
    let passphrase = prompt_password("Wallet passphrase")?;
    let mut unlocked = wallet.unlock(Credentials::passphrase(passphrase)).context("Failed to unlock wallet")?;
    if unlocked.delete(args.force)? {
        println!("Wallet {} deleted", args.wallet.wallet);
    } else {
        bail!("Service refused to delete {}", args.wallet.wallet);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Prompt for a passphrase securely (no echo).
fn prompt_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(format!("{prompt}: ")).context("Failed to read passphrase")
}

fn resolve_config_path(path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(p) = path {
        return Ok(p);
    }
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("keel").join("config.toml"))
}

fn default_backup_path(identifier: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".keel").join(format!("{identifier}.backup.json")))
}
