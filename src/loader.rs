// ============================================================================
// Structure : MergeLoader
// ============================================================================
// Produit la page suivante de records dans l'ordre global (plus récent
// d'abord) en fusionnant les pools des wallets du filtre courant.
//
// ALGORITHME : k-way merge avec un max-heap (BinaryHeap) de SortKey
// 1. Demande un fetch pour chaque pool qui en a besoin (sans attendre)
// 2. Dépile le record le plus récent tant que le compte n'est pas atteint
// 3. S'arrête dès qu'un pool vivant est vide : son prochain record pourrait
//    être plus récent que tout ce qui reste (l'ordre global serait faux).
//    Un pool en échec ne bloque pas les autres.
// 4. done = tous les pools du filtre sont épuisés et vides
// ============================================================================

use std::collections::{BTreeSet, BinaryHeap, HashSet};

use tracing::debug;

use crate::models::{Cursor, SortKey, TransactionRecord, WalletKey};
use crate::pool::{Pool, PoolRepository};

/// Demande de fetch à transmettre à l'adapter du wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub wallet: WalletKey,

    /// Génération du pool au moment de la demande
    pub generation: u64,

    /// Plus ancien record déjà récupéré (None = première page)
    pub cursor: Option<Cursor>,

    pub limit: usize,
}

/// Résultat d'un appel à load_next()
#[derive(Debug, Default)]
pub struct LoadResult {
    /// Records dans l'ordre global, plus récent d'abord
    pub records: Vec<TransactionRecord>,

    /// true si tous les pools du filtre sont épuisés et vides
    pub done: bool,

    /// true si la page est incomplète en attendant des fetchs
    pub waiting: bool,

    /// Fetchs à lancer (chaque pool concerné est déjà marqué "en cours")
    pub fetches: Vec<FetchRequest>,
}

/// Fusion paginée des pools d'un filtre
#[derive(Debug)]
pub struct MergeLoader {
    scope: BTreeSet<WalletKey>,

    /// uid déjà servis pendant cette session de pagination
    served: HashSet<String>,

    fetch_limit: usize,
}

impl MergeLoader {
    pub fn new(scope: impl IntoIterator<Item = WalletKey>, fetch_limit: usize) -> Self {
        Self {
            scope: scope.into_iter().collect(),
            served: HashSet::new(),
            fetch_limit: fetch_limit.max(1),
        }
    }

    pub fn scope(&self) -> &BTreeSet<WalletKey> {
        &self.scope
    }

    pub fn in_scope(&self, wallet: &WalletKey) -> bool {
        self.scope.contains(wallet)
    }

    pub fn is_served(&self, uid: &str) -> bool {
        self.served.contains(uid)
    }

    /// Enregistre un uid servi hors merge (record poussé par la source)
    pub fn mark_served(&mut self, uid: &str) {
        self.served.insert(uid.to_string());
    }

    /// Retire des wallets du filtre (compte supprimé, wallet désactivé)
    pub fn retain_scope(&mut self, keep: impl Fn(&WalletKey) -> bool) {
        self.scope.retain(|wallet| keep(wallet));
    }

    /// Produit jusqu'à `count` records dans l'ordre global
    pub fn load_next(&mut self, repo: &mut PoolRepository, count: usize) -> LoadResult {
        let mut fetches = self.request_fetches(repo);

        let mut heap: BinaryHeap<SortKey> = self
            .scope
            .iter()
            .filter_map(|wallet| repo.pool(wallet))
            .filter_map(|pool| pool.peek().map(TransactionRecord::sort_key))
            .collect();

        let mut records = Vec::with_capacity(count);
        let mut blocked = self.scope_pools(repo).any(is_waiting);

        while records.len() < count && !blocked {
            let Some(head) = heap.pop() else {
                break;
            };
            let Some(pool) = repo.pool_mut(&head.wallet) else {
                continue;
            };
            let Some(record) = pool.pop() else {
                continue;
            };

            match pool.peek() {
                Some(next) => heap.push(next.sort_key()),
                None => blocked = is_waiting(pool),
            }

            if self.served.insert(record.uid.clone()) {
                records.push(record);
            } else {
                debug!(wallet = %head.wallet, uid = %record.uid, "Record already served, skipping");
            }
        }

        // Les pools vidés pendant la fusion ont besoin d'une nouvelle page
        fetches.extend(self.request_fetches(repo));

        let done = self.is_done(repo);
        let waiting = records.len() < count
            && !done
            && self
                .scope_pools(repo)
                .any(|pool| pool.is_fetching() || pool.needs_fetch());

        debug!(
            produced = records.len(),
            requested = count,
            fetches = fetches.len(),
            done,
            waiting,
            "Merge loader page"
        );

        LoadResult {
            records,
            done,
            waiting,
            fetches,
        }
    }

    /// Marque "en cours" et retourne un fetch pour chaque pool du filtre qui en a besoin
    pub fn request_fetches(&self, repo: &mut PoolRepository) -> Vec<FetchRequest> {
        let mut requests = Vec::new();
        for wallet in &self.scope {
            let Some(pool) = repo.pool_mut(wallet) else {
                continue;
            };
            if pool.can_fetch() {
                pool.begin_fetch();
                requests.push(FetchRequest {
                    wallet: wallet.clone(),
                    generation: pool.generation(),
                    cursor: pool.cursor().cloned(),
                    limit: self.fetch_limit,
                });
            }
        }
        requests
    }

    /// true quand chaque pool du filtre est épuisé et vide
    pub fn is_done(&self, repo: &PoolRepository) -> bool {
        self.scope_pools(repo)
            .all(|pool| pool.is_exhausted() && pool.is_empty())
    }

    /// true si un fetch est en cours pour un pool du filtre
    pub fn is_fetching(&self, repo: &PoolRepository) -> bool {
        self.scope_pools(repo).any(Pool::is_fetching)
    }

    /// true si un pool du filtre a échoué à son dernier fetch
    pub fn has_failures(&self, repo: &PoolRepository) -> bool {
        self.scope_pools(repo).any(Pool::has_failed)
    }

    /// true si tous les pools du filtre sont en échec
    pub fn all_failed(&self, repo: &PoolRepository) -> bool {
        let mut pools = self.scope_pools(repo).peekable();
        pools.peek().is_some() && pools.all(Pool::has_failed)
    }

    fn scope_pools<'a>(&'a self, repo: &'a PoolRepository) -> impl Iterator<Item = &'a Pool> + 'a {
        self.scope.iter().filter_map(move |wallet| repo.pool(wallet))
    }
}

/// Pool vide dont la source peut encore livrer des records plus récents
fn is_waiting(pool: &Pool) -> bool {
    pool.is_empty() && !pool.is_exhausted() && !pool.has_failed()
}
