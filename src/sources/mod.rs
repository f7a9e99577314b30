// ============================================================================
// Module : sources
// ============================================================================
// Capacités consommées par le crate :
// - TransactionSource : un adapter de blockchain (un par wallet)
// - RateProvider : service de taux de change
//
// CONCEPT RUST : trait objects (Arc<dyn TransactionSource>)
// - Le loader et le service ne connaissent que la capacité abstraite,
//   jamais le type concret de la coin (Bitcoin, Ethereum, EOS, ...)
// ============================================================================

pub mod memory; // Implémentations en mémoire (démo + tests)

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};

use crate::models::{Cursor, TransactionRecord, Wallet};

pub use memory::{MemoryRateProvider, MemorySource};

/// Taux publié par le service sans demande explicite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateUpdate {
    pub coin: String,
    pub currency: String,
    pub date: NaiveDate,
    pub rate: Decimal,
}

/// Adapter d'une blockchain pour un wallet
#[async_trait]
pub trait TransactionSource: Send + Sync {
    fn wallet(&self) -> &Wallet;

    /// Records strictement plus anciens que `before` (tous si None),
    /// plus récent d'abord, au plus `limit`
    async fn fetch_transactions(
        &self,
        before: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>>;

    fn current_block_height(&self) -> Option<u64>;

    /// Dernier bloc connu ; seule la valeur la plus récente compte
    fn block_height_updates(&self) -> watch::Receiver<Option<u64>>;

    /// Nouvelles transactions ou transactions mises à jour (sync du noeud)
    fn transaction_updates(&self) -> broadcast::Receiver<Vec<TransactionRecord>>;

    fn confirmation_threshold(&self) -> u32 {
        self.wallet().coin.kind.default_confirmation_threshold()
    }
}

/// Service de taux historiques (coin → devise, par jour)
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Lecture synchrone du cache du service
    fn cached_rate(&self, coin: &str, currency: &str, date: NaiveDate) -> Option<Decimal>;

    async fn fetch_rate(&self, coin: &str, currency: &str, date: NaiveDate) -> Result<Decimal>;

    /// Flux des taux arrivés hors demande ; None si le service n'en publie pas
    fn rate_updates(&self) -> Option<broadcast::Receiver<RateUpdate>> {
        None
    }
}
