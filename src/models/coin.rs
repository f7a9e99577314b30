// ============================================================================
// Structures : Coin, CoinKind, WalletKey, Wallet
// ============================================================================
// Identifie la source d'un historique de transactions :
// un compte (account) + une coin = un wallet = un adapter.
//
// CONCEPTS RUST :
// 1. Ord dérivé : l'ordre lexical des champs sert de tie-break déterministe
// 2. Hash + Eq : les WalletKey servent de clé dans les HashMap
// ============================================================================

use std::fmt;

/// Famille de blockchain d'une coin
///
/// Chaque famille a son propre adapter côté wallet ; ici on ne garde que
/// ce qui influence l'affichage (seuil de confirmation par défaut).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoinKind {
    Bitcoin,
    BitcoinCash,
    Dash,
    Ethereum,
    /// Token sur Ethereum (le contrat est porté par le code de la coin)
    Erc20,
    Binance,
    Eos,
    Zcash,
}

impl CoinKind {
    /// Nombre de blocs requis avant qu'une transaction soit considérée finale
    pub fn default_confirmation_threshold(&self) -> u32 {
        match self {
            CoinKind::Bitcoin | CoinKind::BitcoinCash => 3,
            CoinKind::Dash => 3,
            CoinKind::Ethereum | CoinKind::Erc20 => 12,
            CoinKind::Binance => 1,
            CoinKind::Eos => 1,
            CoinKind::Zcash => 10,
        }
    }
}

/// Une coin affichable (ex: BTC, ETH, USDT)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coin {
    /// Code de la coin (ex: "BTC"), sert aussi de clé pour les taux
    pub code: String,

    /// Nom complet (ex: "Bitcoin")
    pub title: String,

    /// Nombre de décimales affichées pour les montants
    pub decimals: u32,

    pub kind: CoinKind,
}

impl Coin {
    pub fn new(code: &str, title: &str, decimals: u32, kind: CoinKind) -> Self {
        Self {
            code: code.to_string(),
            title: title.to_string(),
            decimals,
            kind,
        }
    }
}

/// Identifiant d'une source : (compte, coin)
///
/// CONCEPT RUST : Ord dérivé
/// - Compare account_id puis coin_code (ordre lexical)
/// - Utilisé comme tie-break dans le merge global
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletKey {
    pub account_id: String,
    pub coin_code: String,
}

impl WalletKey {
    pub fn new(account_id: &str, coin_code: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            coin_code: coin_code.to_string(),
        }
    }
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.coin_code)
    }
}

/// Un wallet actif : sa clé + la coin qu'il gère
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Wallet {
    pub key: WalletKey,
    pub coin: Coin,
}

impl Wallet {
    pub fn new(account_id: &str, coin: Coin) -> Self {
        Self {
            key: WalletKey::new(account_id, &coin.code),
            coin,
        }
    }
}
