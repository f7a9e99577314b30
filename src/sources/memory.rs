// ============================================================================
// Sources en mémoire
// ============================================================================
// MemorySource : historique figé servi par pages, avec de quoi simuler
// la latence, les pannes et les notifications (nouveau bloc, nouvelle tx).
// MemoryRateProvider : table de taux connue d'avance.
//
// Utilisées par le binaire de démo et par les tests du service.
// ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::models::{newest_first, Cursor, TransactionRecord, Wallet};
use crate::sources::{RateProvider, RateUpdate, TransactionSource};

/// Adapter simulé pour un wallet
pub struct MemorySource {
    wallet: Wallet,
    threshold: u32,

    /// Historique complet, plus récent d'abord
    records: Mutex<Vec<TransactionRecord>>,

    block_height: watch::Sender<Option<u64>>,
    updates: broadcast::Sender<Vec<TransactionRecord>>,

    latency: Duration,
    failing: AtomicBool,
    fetch_count: AtomicUsize,
}

impl MemorySource {
    pub fn new(wallet: Wallet, mut records: Vec<TransactionRecord>) -> Self {
        records.sort_by(newest_first);
        let threshold = wallet.coin.kind.default_confirmation_threshold();
        let (block_height, _) = watch::channel(None);
        let (updates, _) = broadcast::channel(16);

        Self {
            wallet,
            threshold,
            records: Mutex::new(records),
            block_height,
            updates,
            latency: Duration::ZERO,
            failing: AtomicBool::new(false),
            fetch_count: AtomicUsize::new(0),
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Délai simulé avant chaque réponse de fetch
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_block_height(self, height: u64) -> Self {
        self.block_height.send_replace(Some(height));
        self
    }

    /// Fait échouer (ou non) tous les fetchs suivants
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Nombre d'appels à fetch_transactions
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Nouveau bloc
    pub fn set_block_height(&self, height: u64) {
        self.block_height.send_replace(Some(height));
    }

    /// Ajoute (ou remplace) des records et notifie les abonnés
    pub fn push(&self, pushed: Vec<TransactionRecord>) {
        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            for record in &pushed {
                records.retain(|existing| existing.uid != record.uid);
                records.push(record.clone());
            }
            records.sort_by(newest_first);
        }
        // Pas d'abonné : rien à notifier
        let _ = self.updates.send(pushed);
    }
}

#[async_trait]
impl TransactionSource for MemorySource {
    fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    async fn fetch_transactions(&self, before: Option<Cursor>, limit: usize) -> Result<Vec<TransactionRecord>> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("{} node unreachable", self.wallet.coin.code);
        }

        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let page: Vec<TransactionRecord> = records
            .iter()
            .filter(|record| before.as_ref().map_or(true, |cursor| cursor.is_before(record)))
            .take(limit)
            .cloned()
            .collect();

        debug!(wallet = %self.wallet.key, returned = page.len(), limit, "Memory source page");
        Ok(page)
    }

    fn current_block_height(&self) -> Option<u64> {
        *self.block_height.borrow()
    }

    fn block_height_updates(&self) -> watch::Receiver<Option<u64>> {
        self.block_height.subscribe()
    }

    fn transaction_updates(&self) -> broadcast::Receiver<Vec<TransactionRecord>> {
        self.updates.subscribe()
    }

    fn confirmation_threshold(&self) -> u32 {
        self.threshold
    }
}

/// Service de taux simulé
///
/// `known` : taux que fetch_rate sait retourner ; `cache` : taux déjà récupérés
pub struct MemoryRateProvider {
    known: Mutex<HashMap<(String, String, NaiveDate), Decimal>>,
    cache: Mutex<HashMap<(String, String, NaiveDate), Decimal>>,
    updates: broadcast::Sender<RateUpdate>,
    failing: AtomicBool,
    fetch_count: AtomicUsize,
}

impl Default for MemoryRateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRateProvider {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            known: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            updates,
            failing: AtomicBool::new(false),
            fetch_count: AtomicUsize::new(0),
        }
    }

    /// Déclare un taux disponible au prochain fetch
    pub fn set_rate(&self, coin: &str, currency: &str, date: NaiveDate, rate: Decimal) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((coin.to_string(), currency.to_string(), date), rate);
    }

    /// Déclare un taux déjà en cache (lecture synchrone)
    pub fn set_cached_rate(&self, coin: &str, currency: &str, date: NaiveDate, rate: Decimal) {
        self.set_rate(coin, currency, date, rate);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((coin.to_string(), currency.to_string(), date), rate);
    }

    /// Met le taux en cache et le publie aux abonnés (rafraîchissement du service)
    pub fn publish_rate(&self, coin: &str, currency: &str, date: NaiveDate, rate: Decimal) {
        self.set_cached_rate(coin, currency, date, rate);
        // Pas d'abonné : rien à notifier
        let _ = self.updates.send(RateUpdate {
            coin: coin.to_string(),
            currency: currency.to_string(),
            date,
            rate,
        });
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateProvider for MemoryRateProvider {
    fn cached_rate(&self, coin: &str, currency: &str, date: NaiveDate) -> Option<Decimal> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(coin.to_string(), currency.to_string(), date))
            .copied()
    }

    async fn fetch_rate(&self, coin: &str, currency: &str, date: NaiveDate) -> Result<Decimal> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("rate service unavailable");
        }

        let key = (coin.to_string(), currency.to_string(), date);
        let rate = self
            .known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied();

        match rate {
            Some(rate) => {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, rate);
                Ok(rate)
            }
            None => anyhow::bail!("no {}/{} rate for {}", coin, currency, date),
        }
    }

    fn rate_updates(&self) -> Option<broadcast::Receiver<RateUpdate>> {
        Some(self.updates.subscribe())
    }
}
