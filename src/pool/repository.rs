// ============================================================================
// Structure : PoolRepository
// ============================================================================
// Possède un Pool par wallet actif (map de structs par valeur, pas de
// référence partagée qui sortirait du point de mutation unique).
// ============================================================================

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::models::WalletKey;
use crate::pool::Pool;

/// Ensemble des pools des wallets actifs
#[derive(Debug, Default)]
pub struct PoolRepository {
    pools: BTreeMap<WalletKey, Pool>,

    /// Compteur de générations, jamais réutilisé
    next_generation: u64,
}

impl PoolRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aligne les pools sur l'ensemble de wallets donné (idempotent)
    ///
    /// Crée les pools manquants, supprime ceux des wallets retirés.
    /// Les fetchs en cours des pools supprimés seront ignorés à leur arrivée.
    pub fn set_active_wallets(&mut self, wallets: &HashSet<WalletKey>) {
        let removed: Vec<WalletKey> = self
            .pools
            .keys()
            .filter(|key| !wallets.contains(*key))
            .cloned()
            .collect();

        for key in removed {
            debug!(wallet = %key, "Removing pool");
            self.pools.remove(&key);
        }

        for key in wallets {
            if !self.pools.contains_key(key) {
                self.next_generation += 1;
                debug!(wallet = %key, generation = self.next_generation, "Creating pool");
                self.pools
                    .insert(key.clone(), Pool::new(key.clone(), self.next_generation));
            }
        }
    }

    pub fn pool(&self, wallet: &WalletKey) -> Option<&Pool> {
        self.pools.get(wallet)
    }

    pub fn pool_mut(&mut self, wallet: &WalletKey) -> Option<&mut Pool> {
        self.pools.get_mut(wallet)
    }

    /// Pool du wallet seulement s'il s'agit toujours de la même instance
    pub fn pool_for_generation(&mut self, wallet: &WalletKey, generation: u64) -> Option<&mut Pool> {
        self.pools
            .get_mut(wallet)
            .filter(|pool| pool.generation() == generation)
    }

    /// Supprime tous les pools des wallets du compte
    pub fn handle_deleted_account(&mut self, account_id: &str) {
        self.pools.retain(|key, _| key.account_id != account_id);
    }

    /// Wallets actifs, en ordre lexical
    pub fn wallets(&self) -> impl Iterator<Item = &WalletKey> {
        self.pools.keys()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[(&str, &str)]) -> HashSet<WalletKey> {
        list.iter().map(|(a, c)| WalletKey::new(a, c)).collect()
    }

    #[test]
    fn test_set_active_wallets_creates_and_removes() {
        let mut repo = PoolRepository::new();
        repo.set_active_wallets(&keys(&[("acc", "BTC"), ("acc", "ETH")]));
        assert_eq!(repo.len(), 2);

        repo.set_active_wallets(&keys(&[("acc", "ETH"), ("acc", "DASH")]));
        assert_eq!(repo.len(), 2);
        assert!(repo.pool(&WalletKey::new("acc", "BTC")).is_none());
        assert!(repo.pool(&WalletKey::new("acc", "DASH")).is_some());
    }

    #[test]
    fn test_set_active_wallets_is_idempotent() {
        let mut repo = PoolRepository::new();
        let wallets = keys(&[("acc", "BTC")]);
        repo.set_active_wallets(&wallets);
        let generation = repo.pool(&WalletKey::new("acc", "BTC")).map(|p| p.generation());

        repo.set_active_wallets(&wallets);
        assert_eq!(repo.pool(&WalletKey::new("acc", "BTC")).map(|p| p.generation()), generation);
    }

    #[test]
    fn test_re_added_wallet_gets_new_generation() {
        let mut repo = PoolRepository::new();
        let btc = WalletKey::new("acc", "BTC");
        repo.set_active_wallets(&keys(&[("acc", "BTC")]));
        let first = repo.pool(&btc).map(|p| p.generation()).unwrap();

        repo.set_active_wallets(&HashSet::new());
        repo.set_active_wallets(&keys(&[("acc", "BTC")]));

        assert!(repo.pool_for_generation(&btc, first).is_none());
    }

    #[test]
    fn test_handle_deleted_account() {
        let mut repo = PoolRepository::new();
        repo.set_active_wallets(&keys(&[("a1", "BTC"), ("a1", "ETH"), ("a2", "BTC")]));
        repo.handle_deleted_account("a1");

        let remaining: Vec<_> = repo.wallets().cloned().collect();
        assert_eq!(remaining, vec![WalletKey::new("a2", "BTC")]);
    }
}
