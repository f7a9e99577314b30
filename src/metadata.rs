// ============================================================================
// Structure : MetadataStore
// ============================================================================
// Table annexe consultée à la construction des view items :
// - dernier bloc connu par coin
// - seuil de confirmation par coin
// - taux de change par (coin, jour)
//
// Un taux stocké n'est jamais évincé pendant la session ; seul clear_rates()
// (changement de devise de référence) vide le cache.
// ============================================================================

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::{Currency, CurrencyValue};

/// Vue figée des métadonnées d'un record au moment de la projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub last_block_height: Option<u64>,
    pub confirmation_threshold: Option<u32>,
    pub rate: Option<CurrencyValue>,
}

/// Cache des métadonnées, clé = code de la coin
#[derive(Debug)]
pub struct MetadataStore {
    currency: Currency,
    last_block_heights: HashMap<String, u64>,
    thresholds: HashMap<String, u32>,
    rates: HashMap<(String, NaiveDate), Decimal>,
}

impl MetadataStore {
    pub fn new(currency: Currency) -> Self {
        Self {
            currency,
            last_block_heights: HashMap::new(),
            thresholds: HashMap::new(),
            rates: HashMap::new(),
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn last_block_height(&self, coin: &str) -> Option<u64> {
        self.last_block_heights.get(coin).copied()
    }

    /// Met à jour le dernier bloc ; retourne l'ancienne valeur
    pub fn set_last_block_height(&mut self, coin: &str, height: u64) -> Option<u64> {
        self.last_block_heights.insert(coin.to_string(), height)
    }

    pub fn threshold(&self, coin: &str) -> Option<u32> {
        self.thresholds.get(coin).copied()
    }

    pub fn set_threshold(&mut self, coin: &str, threshold: u32) {
        self.thresholds.insert(coin.to_string(), threshold);
    }

    pub fn rate(&self, coin: &str, date: NaiveDate) -> Option<Decimal> {
        self.rates.get(&(coin.to_string(), date)).copied()
    }

    pub fn set_rate(&mut self, coin: &str, date: NaiveDate, rate: Decimal) {
        self.rates.insert((coin.to_string(), date), rate);
    }

    /// Vide les taux et change la devise de référence
    pub fn clear_rates(&mut self, currency: Currency) {
        self.currency = currency;
        self.rates.clear();
    }

    pub fn snapshot(&self, coin: &str, date: NaiveDate) -> MetadataSnapshot {
        MetadataSnapshot {
            last_block_height: self.last_block_height(coin),
            confirmation_threshold: self.threshold(coin),
            rate: self.rate(coin, date).map(|value| CurrencyValue {
                currency: self.currency.clone(),
                value,
            }),
        }
    }
}
