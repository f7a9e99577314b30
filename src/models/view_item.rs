// ============================================================================
// Structure : ViewItem
// ============================================================================
// Projection prête à afficher d'un TransactionRecord + métadonnées.
// Jamais modifiée : on la reconstruit et on la remplace entièrement.
//
// CONCEPTS RUST :
// 1. PartialEq dérivé = égalité de contenu (utilisée par le diff)
// 2. Enums avec données : TransactionStatus::Confirming(n)
// ============================================================================

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;

use crate::models::WalletKey;

/// Devise de référence pour les montants convertis
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Currency {
    /// Code ISO (ex: "USD")
    pub code: String,

    /// Symbole affiché (ex: "$")
    pub symbol: String,

    pub decimals: u32,
}

impl Currency {
    pub fn new(code: &str, symbol: &str, decimals: u32) -> Self {
        Self {
            code: code.to_string(),
            symbol: symbol.to_string(),
            decimals,
        }
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::new("USD", "$", 2)
    }
}

/// Montant exprimé dans une coin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinValue {
    pub coin_code: String,
    pub value: Decimal,
}

impl CoinValue {
    /// Format : "-0.0012 BTC"
    pub fn display(&self, decimals: u32) -> String {
        let rounded = self
            .value
            .round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
            .normalize();
        format!("{} {}", rounded, self.coin_code)
    }
}

/// Montant exprimé dans la devise de référence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyValue {
    pub currency: Currency,
    pub value: Decimal,
}

impl CurrencyValue {
    /// Format : "$12.30" ou "-$12.30"
    pub fn display(&self) -> String {
        let mut rounded = self
            .value
            .abs()
            .round_dp_with_strategy(self.currency.decimals, RoundingStrategy::MidpointAwayFromZero);
        // Affiche toujours le nombre de décimales de la devise ("5.00")
        rounded.rescale(self.currency.decimals);

        let sign = if self.value.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
        format!("{}{}{}", sign, self.currency.symbol, rounded)
    }
}

/// État de confirmation d'une transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Pas encore dans un bloc
    Pending,

    /// Dans un bloc, nombre de confirmations < seuil
    Confirming(u64),

    /// Seuil de confirmation atteint
    Confirmed,

    /// Transaction rejetée par la chaîne
    Failed,
}

/// Sens de la transaction vu depuis le wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    SentToSelf,
}

/// Élément affichable de la liste des transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewItem {
    /// Même identité que le record source
    pub uid: String,

    pub transaction_hash: String,

    pub wallet: WalletKey,

    pub coin_value: CoinValue,

    pub fee_coin_value: Option<CoinValue>,

    /// None tant que le taux n'est pas connu ("rate pending")
    pub currency_value: Option<CurrencyValue>,

    pub rate: Option<CurrencyValue>,

    pub direction: Direction,

    /// Adresse de la contrepartie (expéditeur si entrant, destinataire sinon)
    pub counterpart: Option<String>,

    pub timestamp: i64,

    /// Bucket journalier du taux
    pub date: NaiveDate,

    pub status: TransactionStatus,

    /// Texte principal : "+0.5 BTC"
    pub amount_text: String,

    /// Texte secondaire : "$12.30", vide si le taux est attendu
    pub currency_text: String,
}

impl ViewItem {
    /// true si le montant converti attend encore un taux
    pub fn rate_pending(&self) -> bool {
        self.currency_value.is_none()
    }

    pub fn is_confirming(&self) -> bool {
        matches!(self.status, TransactionStatus::Confirming(_))
    }
}
