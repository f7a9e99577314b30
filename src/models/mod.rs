// ============================================================================
// Module : models
// ============================================================================
// Structures de données partagées par tout le crate :
// sources (coin, wallet), faits (records) et projections (view items)
// ============================================================================

pub mod coin;      // Coin, CoinKind, WalletKey, Wallet
pub mod record;    // TransactionRecord et ordre total
pub mod view_item; // ViewItem et valeurs formatées

// Re-export des structures principales pour simplifier les imports
pub use coin::{Coin, CoinKind, Wallet, WalletKey};
pub use record::{newest_first, Cursor, SortKey, TransactionAddress, TransactionRecord};
pub use view_item::{CoinValue, Currency, CurrencyValue, Direction, TransactionStatus, ViewItem};
