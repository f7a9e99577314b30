// ============================================================================
// Structure : TransactionRecord
// ============================================================================
// Fait immuable et normalisé produit par un adapter (une transaction, ou une
// "jambe" d'une transaction multi-sorties).
//
// CONCEPTS RUST :
// 1. Decimal (rust_decimal) : virgule fixe, pas de dérive d'arrondi
// 2. Ord manuel : ordre total utilisé par le merge et le tri des pools
// 3. NaiveDate : bucket journalier pour la recherche des taux
// ============================================================================

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::models::WalletKey;

/// Adresse d'un côté de la transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionAddress {
    pub address: String,

    /// true si l'adresse appartient au wallet
    pub mine: bool,
}

impl TransactionAddress {
    pub fn new(address: &str, mine: bool) -> Self {
        Self {
            address: address.to_string(),
            mine,
        }
    }
}

/// Transaction normalisée
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionRecord {
    /// Identité globale : hash + sous-index (clé du diff)
    pub uid: String,

    pub transaction_hash: String,

    /// Source qui a produit ce record
    pub wallet: WalletKey,

    /// Secondes depuis l'epoch
    pub timestamp: i64,

    pub transaction_index: u32,

    /// Index de la jambe dans une transaction multi-sorties
    pub sub_index: u32,

    /// None : transaction pas encore minée
    pub block_height: Option<u64>,

    /// Montant signé (négatif pour un envoi)
    pub amount: Decimal,

    pub fee: Option<Decimal>,

    pub from: Vec<TransactionAddress>,

    pub to: Vec<TransactionAddress>,

    pub failed: bool,
}

impl TransactionRecord {
    /// Crée un record minimal ; l'uid est dérivé du hash et du sous-index
    pub fn new(
        wallet: WalletKey,
        transaction_hash: &str,
        sub_index: u32,
        timestamp: i64,
        amount: Decimal,
    ) -> Self {
        Self {
            uid: Self::make_uid(transaction_hash, sub_index),
            transaction_hash: transaction_hash.to_string(),
            wallet,
            timestamp,
            transaction_index: 0,
            sub_index,
            block_height: None,
            amount,
            fee: None,
            from: Vec::new(),
            to: Vec::new(),
            failed: false,
        }
    }

    pub fn make_uid(transaction_hash: &str, sub_index: u32) -> String {
        format!("{}:{}", transaction_hash, sub_index)
    }

    pub fn with_block_height(mut self, block_height: u64) -> Self {
        self.block_height = Some(block_height);
        self
    }

    pub fn with_transaction_index(mut self, transaction_index: u32) -> Self {
        self.transaction_index = transaction_index;
        self
    }

    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn with_addresses(mut self, from: Vec<TransactionAddress>, to: Vec<TransactionAddress>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn failed(mut self) -> Self {
        self.failed = true;
        self
    }

    /// Date UTC du record
    pub fn date(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Bucket journalier utilisé comme clé des taux de change
    pub fn date_bucket(&self) -> NaiveDate {
        self.date()
            .map(|date| date.date_naive())
            .unwrap_or_default()
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            timestamp: self.timestamp,
            transaction_index: self.transaction_index,
            sub_index: self.sub_index,
            wallet: self.wallet.clone(),
            uid: self.uid.clone(),
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor { key: self.sort_key() }
    }
}

// ============================================================================
// Ordre total
// ============================================================================
// La liste est affichée du plus récent au plus ancien.
// SortKey "plus grand" = affiché plus haut :
//   timestamp, puis transaction_index, puis sub_index (croissants = plus récents)
//   puis wallet, puis uid en ordre lexical (le plus petit est affiché en premier)
// ============================================================================

/// Clé de tri globale d'un record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub timestamp: i64,
    pub transaction_index: u32,
    pub sub_index: u32,
    pub wallet: WalletKey,
    pub uid: String,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.transaction_index.cmp(&other.transaction_index))
            .then(self.sub_index.cmp(&other.sub_index))
            .then_with(|| other.wallet.cmp(&self.wallet))
            .then_with(|| other.uid.cmp(&self.uid))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Comparateur "affichage" : le record le plus récent vient en premier
pub fn newest_first(a: &TransactionRecord, b: &TransactionRecord) -> Ordering {
    b.sort_key().cmp(&a.sort_key())
}

/// Position de pagination d'une source : le plus ancien record déjà récupéré
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub key: SortKey,
}

impl Cursor {
    /// true si le record est strictement plus ancien que le curseur
    pub fn is_before(&self, record: &TransactionRecord) -> bool {
        record.sort_key() < self.key
    }
}
