//! Wallet constants. All monetary values in satoshi (1 BTC = 10^8 sat).

pub const COIN: u64 = 100_000_000;

/// Outputs (and change) below this value are uneconomical to spend.
///
/// Change that would fall below the threshold is folded into the fee.
pub const DUST_THRESHOLD: u64 = 2_730;

/// Fallback fee rate for the `Optimal` strategy, sat per 1000 bytes.
pub const DEFAULT_OPTIMAL_FEE_PER_KB: u64 = 10_000;

/// Fallback fee rate for the `LowPriority` strategy, sat per 1000 bytes.
pub const DEFAULT_LOW_PRIORITY_FEE_PER_KB: u64 = 5_000;

/// Largest OP_RETURN scriptPubKey relayed as standard.
pub const MAX_STANDARD_OP_RETURN_SCRIPT_LEN: usize = 40;

/// Signatures required to spend a wallet output.
pub const REQUIRED_SIGNATURES: usize = 2;

/// Keys in every wallet redeem script (primary, backup, cosigner).
pub const TOTAL_KEYS: usize = 3;

// Size estimation (bytes).

/// Worst-case P2SH 2-of-3 multisig input: outpoint, sequence, two
/// signatures and the 105-byte redeem script.
pub const P2SH_MULTISIG_INPUT_SIZE: usize = 297;

/// Output framing on top of the scriptPubKey: 8-byte value + 1-byte length.
pub const OUTPUT_FRAMING_SIZE: usize = 9;

/// A standard P2PKH output.
pub const OUTPUT_SIZE: usize = 34;

/// Version, locktime and the input/output counters.
pub const TX_OVERHEAD_SIZE: usize = 10;

/// Length of a P2SH scriptPubKey, used when sizing the change output.
pub const P2SH_SCRIPT_PUBKEY_LEN: usize = 23;

// Locks and discovery.

/// Default time-to-live for advisory UTXO locks, seconds.
pub const DEFAULT_UTXO_LOCK_TTL_SECS: u64 = 3;

/// Addresses scanned per batch during discovery and sweeping.
pub const DEFAULT_DISCOVERY_INCREMENT: u32 = 200;

/// Address chain for receive addresses.
pub const EXTERNAL_CHAIN: u32 = 0;

/// Address chain for change addresses.
pub const CHANGE_CHAIN: u32 = 1;

// Pagination.

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Confirmations after which a transaction subscription stops firing.
pub const DEFAULT_SUBSCRIBE_CONFIRMATIONS: u32 = 6;

/// Bytes of randomness in a generated wallet identifier.
pub const WALLET_IDENTIFIER_BYTES: usize = 10;
