// ============================================================================
// Structure : ViewItemProjector
// ============================================================================
// Convertit un TransactionRecord + MetadataSnapshot en ViewItem.
//
// Fonction pure (mêmes entrées = ViewItem égal en contenu), mémoïsée par uid :
// la clé du cache est le hash du record + le snapshot + la coin. Si rien n'a
// changé, on renvoie le ViewItem déjà construit.
// ============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::metadata::MetadataSnapshot;
use crate::models::{
    Coin, CoinValue, CurrencyValue, Direction, TransactionAddress, TransactionRecord,
    TransactionStatus, ViewItem,
};

#[derive(Debug, PartialEq)]
struct MemoKey {
    record_hash: u64,
    coin: Coin,
    metadata: MetadataSnapshot,
}

/// Fabrique de ViewItem avec cache par uid
#[derive(Debug, Default)]
pub struct ViewItemProjector {
    cache: HashMap<String, (MemoKey, ViewItem)>,
}

impl ViewItemProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Projette un record, en réutilisant le dernier ViewItem si les entrées n'ont pas changé
    pub fn project(&mut self, record: &TransactionRecord, coin: &Coin, metadata: &MetadataSnapshot) -> ViewItem {
        let key = MemoKey {
            record_hash: hash_record(record),
            coin: coin.clone(),
            metadata: metadata.clone(),
        };

        if let Some((cached_key, item)) = self.cache.get(&record.uid) {
            if *cached_key == key {
                return item.clone();
            }
        }

        let item = build_view_item(record, coin, metadata);
        self.cache.insert(record.uid.clone(), (key, item.clone()));
        item
    }

    /// Oublie le ViewItem d'un uid (record retiré de la liste)
    pub fn forget(&mut self, uid: &str) {
        self.cache.remove(uid);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn hash_record(record: &TransactionRecord) -> u64 {
    let mut hasher = DefaultHasher::new();
    record.hash(&mut hasher);
    hasher.finish()
}

/// Construit le ViewItem sans cache
pub fn build_view_item(record: &TransactionRecord, coin: &Coin, metadata: &MetadataSnapshot) -> ViewItem {
    let direction = direction(record);
    let sign = match direction {
        Direction::Incoming => "+",
        Direction::Outgoing => "-",
        Direction::SentToSelf => "",
    };

    let coin_value = CoinValue {
        coin_code: coin.code.clone(),
        value: record.amount,
    };
    let amount_text = format!(
        "{}{}",
        sign,
        CoinValue {
            coin_code: coin.code.clone(),
            value: record.amount.abs(),
        }
        .display(coin.decimals)
    );

    let currency_value = metadata.rate.as_ref().map(|rate| CurrencyValue {
        currency: rate.currency.clone(),
        value: record.amount * rate.value,
    });
    let currency_text = currency_value
        .as_ref()
        .map(|value| {
            CurrencyValue {
                currency: value.currency.clone(),
                value: value.value.abs(),
            }
            .display()
        })
        .unwrap_or_default();

    ViewItem {
        uid: record.uid.clone(),
        transaction_hash: record.transaction_hash.clone(),
        wallet: record.wallet.clone(),
        coin_value,
        fee_coin_value: record.fee.map(|fee| CoinValue {
            coin_code: coin.code.clone(),
            value: fee,
        }),
        currency_value,
        rate: metadata.rate.clone(),
        direction,
        counterpart: counterpart(record, direction),
        timestamp: record.timestamp,
        date: record.date_bucket(),
        status: status(record, metadata),
        amount_text,
        currency_text,
    }
}

/// État de confirmation
///
/// confirmations = dernier bloc - bloc du record + 1
/// Dernier bloc inconnu (ou en retard sur le record) : 1 confirmation.
/// Seuil inconnu : 1.
pub fn status(record: &TransactionRecord, metadata: &MetadataSnapshot) -> TransactionStatus {
    if record.failed {
        return TransactionStatus::Failed;
    }

    let Some(block_height) = record.block_height else {
        return TransactionStatus::Pending;
    };

    let confirmations = match metadata.last_block_height {
        Some(last) if last >= block_height => last - block_height + 1,
        _ => 1,
    };
    let threshold = u64::from(metadata.confirmation_threshold.unwrap_or(1));

    if confirmations >= threshold {
        TransactionStatus::Confirmed
    } else {
        TransactionStatus::Confirming(confirmations)
    }
}

/// Sens de la transaction d'après les flags "mine" des adresses
pub fn direction(record: &TransactionRecord) -> Direction {
    let all_mine = |addresses: &[TransactionAddress]| {
        !addresses.is_empty() && addresses.iter().all(|a| a.mine)
    };

    if all_mine(&record.from) && all_mine(&record.to) {
        return Direction::SentToSelf;
    }
    if record.from.iter().any(|a| a.mine) {
        return Direction::Outgoing;
    }
    if record.to.iter().any(|a| a.mine) {
        return Direction::Incoming;
    }

    // Pas d'info d'adresse : on se fie au signe du montant
    if record.amount.is_sign_negative() {
        Direction::Outgoing
    } else {
        Direction::Incoming
    }
}

fn counterpart(record: &TransactionRecord, direction: Direction) -> Option<String> {
    let side = match direction {
        Direction::Incoming => &record.from,
        Direction::Outgoing | Direction::SentToSelf => &record.to,
    };

    side.iter()
        .find(|a| !a.mine)
        .or_else(|| side.first())
        .map(|a| a.address.clone())
}
