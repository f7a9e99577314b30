// ============================================================================
// Structure : TransactionsOrchestrator
// ============================================================================
// Point de mutation unique de la liste des transactions.
//
// Chaque événement (changement de wallets, filtre, loadMore, résultat de
// fetch, nouveau bloc, taux récupéré...) passe par une méthode &mut self qui
// retourne une Reaction :
// - les commandes à exécuter (fetch d'une page, fetch d'un taux, retry)
// - la mise à jour à publier (items + diff + statut), si quelque chose a changé
//
// L'orchestrateur ne fait aucune I/O : le service (service.rs) exécute les
// commandes et renvoie leurs résultats comme de nouveaux événements.
//
// STATE MACHINE :
//   Idle ──set_wallets──▶ LoadingInitial ──page complète──▶ Ready
//   Ready ──load_more──▶ LoadingMore ──page complète──▶ Ready
//   (changement de filtre / de wallets : retour à LoadingInitial)
// ============================================================================

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::diff::{diff, EditScript};
use crate::loader::{FetchRequest, MergeLoader};
use crate::metadata::MetadataStore;
use crate::models::{newest_first, Currency, TransactionRecord, ViewItem, Wallet, WalletKey};
use crate::pool::PoolRepository;
use crate::projector::ViewItemProjector;
use crate::sources::RateProvider;

/// Étape de pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Aucun wallet reçu
    Idle,

    /// Première page du filtre courant en cours
    LoadingInitial,

    /// Page demandée livrée (ou plus rien à attendre)
    Ready,

    /// Page suivante en cours
    LoadingMore,
}

/// Statut affiché avec la liste
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStatus {
    /// Rien à afficher encore, fetchs en cours
    Loading,

    Ready,

    /// Au moins une source du filtre est en échec
    Partial,

    /// Toutes les sources du filtre sont en échec et rien n'est affiché
    Failed,

    /// Toutes les sources sont épuisées, aucune transaction
    Empty,
}

/// Wallet actif tel que décrit par son adapter
#[derive(Debug, Clone)]
pub struct WalletSetup {
    pub wallet: Wallet,
    pub confirmation_threshold: u32,
    pub last_block_height: Option<u64>,
}

/// Travail à effectuer hors de l'orchestrateur
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Récupérer une page auprès de l'adapter du wallet
    Fetch(FetchRequest),

    /// Récupérer le taux d'une coin pour un jour
    FetchRate {
        coin: String,
        currency: String,
        date: NaiveDate,
    },

    /// Appeler retry_due() après `delay`
    ScheduleRetry {
        wallet: WalletKey,
        generation: u64,
        delay: Duration,
    },
}

/// Nouvel état de la liste, avec le script d'édition depuis le précédent
#[derive(Debug, Clone)]
pub struct ListUpdate {
    pub items: Vec<ViewItem>,
    pub diff: EditScript<ViewItem>,
    pub status: ListStatus,
}

/// Résultat du traitement d'un événement
#[derive(Debug, Default)]
pub struct Reaction {
    pub commands: Vec<Command>,
    pub update: Option<ListUpdate>,
}

/// Record affiché et sa projection courante
#[derive(Debug)]
struct Entry {
    record: TransactionRecord,
    item: ViewItem,
}

pub struct TransactionsOrchestrator {
    settings: Settings,
    rates: Arc<dyn RateProvider>,

    repo: PoolRepository,
    metadata: MetadataStore,
    projector: ViewItemProjector,

    /// Wallets actifs, triés (ordre des options de filtre)
    wallets: BTreeMap<WalletKey, Wallet>,
    filter: Option<WalletKey>,
    loader: MergeLoader,
    state: LoadState,

    /// Records affichés, plus récent d'abord
    entries: Vec<Entry>,

    /// Nombre de records visés par les pages demandées
    target: usize,
    done: bool,

    /// (coin, devise, jour) dont le taux est en cours de fetch
    rate_requests: HashSet<(String, String, NaiveDate)>,

    commands: Vec<Command>,

    /// Dernier état publié (base du prochain diff)
    published: Vec<ViewItem>,
    published_status: Option<ListStatus>,
}

impl TransactionsOrchestrator {
    pub fn new(settings: Settings, rates: Arc<dyn RateProvider>) -> Self {
        let metadata = MetadataStore::new(settings.base_currency.clone());
        let loader = MergeLoader::new(Vec::new(), settings.fetch_limit);

        Self {
            settings,
            rates,
            repo: PoolRepository::new(),
            metadata,
            projector: ViewItemProjector::new(),
            wallets: BTreeMap::new(),
            filter: None,
            loader,
            state: LoadState::Idle,
            entries: Vec::new(),
            target: 0,
            done: false,
            rate_requests: HashSet::new(),
            commands: Vec::new(),
            published: Vec::new(),
            published_status: None,
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn filter(&self) -> Option<&WalletKey> {
        self.filter.as_ref()
    }

    /// Liste telle que publiée par la dernière mise à jour
    pub fn items(&self) -> &[ViewItem] {
        &self.published
    }

    pub fn currency(&self) -> &Currency {
        self.metadata.currency()
    }

    pub fn status(&self) -> ListStatus {
        if self.state == LoadState::Idle {
            return ListStatus::Loading;
        }

        if self.entries.is_empty() {
            if self.loader.all_failed(&self.repo) {
                return ListStatus::Failed;
            }
            if self.done {
                return ListStatus::Empty;
            }
            if self.state != LoadState::Ready {
                return ListStatus::Loading;
            }
        }

        if self.loader.has_failures(&self.repo) {
            ListStatus::Partial
        } else {
            ListStatus::Ready
        }
    }

    /// Options du sélecteur : vide avec moins de deux wallets, sinon "tous" puis chaque wallet
    pub fn current_filter_options(&self) -> Vec<Option<WalletKey>> {
        if self.wallets.len() < 2 {
            return Vec::new();
        }
        std::iter::once(None)
            .chain(self.wallets.keys().cloned().map(Some))
            .collect()
    }

    // ========================================================================
    // Événements
    // ========================================================================

    /// Remplace l'ensemble des wallets actifs et recharge la première page
    ///
    /// Même ensemble de wallets : la pagination en cours est gardée, seuls
    /// les items touchés par un nouveau seuil ou une nouvelle hauteur sont reconstruits.
    pub fn set_wallets(&mut self, setups: Vec<WalletSetup>) -> Reaction {
        let previous: HashSet<WalletKey> = self.wallets.keys().cloned().collect();
        let mut metadata_changed = false;

        self.wallets.clear();
        for setup in setups {
            let coin = setup.wallet.coin.code.clone();
            if self.metadata.threshold(&coin) != Some(setup.confirmation_threshold) {
                self.metadata.set_threshold(&coin, setup.confirmation_threshold);
                metadata_changed = true;
            }
            if let Some(height) = setup.last_block_height {
                if self.metadata.last_block_height(&coin).map_or(true, |known| known < height) {
                    self.metadata.set_last_block_height(&coin, height);
                    metadata_changed = true;
                }
            }
            self.wallets.insert(setup.wallet.key.clone(), setup.wallet);
        }

        let keys: HashSet<WalletKey> = self.wallets.keys().cloned().collect();
        if keys == previous && self.state != LoadState::Idle {
            if metadata_changed {
                let updated = self.reproject(|_| true);
                debug!(updated, "Wallet metadata updated");
            }
            debug!(wallets = keys.len(), "Active wallets unchanged, pagination kept");
            return self.react();
        }

        self.repo.set_active_wallets(&keys);
        info!(wallets = keys.len(), "Active wallets updated");

        self.drop_stale_filter();
        self.restart();
        self.react()
    }

    pub fn select_filter(&mut self, filter: Option<WalletKey>) -> Reaction {
        if filter == self.filter {
            return self.react();
        }
        if let Some(wallet) = &filter {
            if !self.wallets.contains_key(wallet) {
                warn!(wallet = %wallet, "Filter on unknown wallet ignored");
                return self.react();
            }
        }

        info!(filter = ?filter, "Filter changed");
        self.filter = filter;
        self.restart();
        self.react()
    }

    /// Demande la page suivante ; ignoré si un chargement est déjà en cours
    pub fn load_more(&mut self) -> Reaction {
        if self.state != LoadState::Ready || self.done {
            debug!(state = ?self.state, done = self.done, "load_more ignored");
            return self.react();
        }

        self.target = self.entries.len() + self.settings.page_size.max(1);
        self.state = LoadState::LoadingMore;
        self.fill();
        self.react()
    }

    /// Résultat d'un Command::Fetch
    pub fn fetch_completed(&mut self, request: FetchRequest, result: Result<Vec<TransactionRecord>>) -> Reaction {
        let Some(pool) = self.repo.pool_for_generation(&request.wallet, request.generation) else {
            debug!(
                wallet = %request.wallet,
                generation = request.generation,
                "Discarding fetch result for removed wallet"
            );
            return self.react();
        };

        match result {
            Ok(mut records) => {
                let received = records.len();
                records.retain(|record| record.wallet == request.wallet);
                if records.len() != received {
                    warn!(
                        wallet = %request.wallet,
                        foreign = received - records.len(),
                        "Source returned records of another wallet"
                    );
                }
                debug!(wallet = %request.wallet, received, "Fetch completed");
                pool.append(records, request.limit);
            }
            Err(err) => {
                pool.fetch_failed();
                pool.defer();
                let failures = pool.failures();
                let delay = self.settings.retry_delay(failures);
                warn!(
                    wallet = %request.wallet,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Fetch failed, retry scheduled"
                );
                self.commands.push(Command::ScheduleRetry {
                    wallet: request.wallet.clone(),
                    generation: request.generation,
                    delay,
                });
            }
        }

        if self.loader.in_scope(&request.wallet) {
            self.fill();
        }
        self.react()
    }

    /// Fin du backoff d'un pool en échec
    pub fn retry_due(&mut self, wallet: &WalletKey, generation: u64) -> Reaction {
        let Some(pool) = self.repo.pool_for_generation(wallet, generation) else {
            debug!(wallet = %wallet, generation, "Retry for removed wallet ignored");
            return self.react();
        };
        pool.resume();

        if self.loader.in_scope(wallet) {
            self.fetch_now(wallet);
            self.fill();
        }
        self.react()
    }

    /// Relance immédiatement les sources en échec du filtre courant
    pub fn retry_failed(&mut self) -> Reaction {
        let failed: Vec<WalletKey> = self
            .loader
            .scope()
            .iter()
            .filter(|wallet| self.repo.pool(wallet).map_or(false, |pool| pool.has_failed()))
            .cloned()
            .collect();

        for wallet in &failed {
            if let Some(pool) = self.repo.pool_mut(wallet) {
                pool.resume();
            }
            self.fetch_now(wallet);
        }
        self.react()
    }

    /// Records poussés par un adapter (nouvelle transaction ou mise à jour)
    pub fn transactions_updated(&mut self, wallet: &WalletKey, records: Vec<TransactionRecord>) -> Reaction {
        if !self.wallets.contains_key(wallet) {
            debug!(wallet = %wallet, "Update for unknown wallet ignored");
            return self.react();
        }

        let in_scope = self.loader.in_scope(wallet);
        let mut buffered = Vec::new();
        let mut shown = Vec::new();

        for record in records.into_iter().filter(|record| record.wallet == *wallet) {
            if let Some(index) = self.entries.iter().position(|entry| entry.record.uid == record.uid) {
                if let Some(item) = self.project(&record) {
                    self.entries[index] = Entry { record, item };
                }
                continue;
            }

            let visible = in_scope
                && (self.done
                    || self
                        .entries
                        .last()
                        .map_or(false, |tail| record.sort_key() > tail.record.sort_key()));

            if visible {
                self.loader.mark_served(&record.uid);
                shown.push(record);
            } else {
                buffered.push(record);
            }
        }

        debug!(wallet = %wallet, shown = shown.len(), buffered = buffered.len(), "Transactions pushed");

        if !buffered.is_empty() {
            if let Some(pool) = self.repo.pool_mut(wallet) {
                pool.insert(buffered);
            }
        }
        self.insert_entries(shown);
        self.entries.sort_by(|a, b| newest_first(&a.record, &b.record));

        if in_scope {
            self.fill();
        }
        self.react()
    }

    /// Nouveau bloc : seuls les items en cours de confirmation de la coin sont reconstruits
    pub fn block_height_updated(&mut self, wallet: &WalletKey, height: u64) -> Reaction {
        let Some(coin) = self.wallets.get(wallet).map(|wallet| wallet.coin.code.clone()) else {
            debug!(wallet = %wallet, "Block height for unknown wallet ignored");
            return self.react();
        };

        if self.metadata.last_block_height(&coin).map_or(false, |known| known >= height) {
            return self.react();
        }
        self.metadata.set_last_block_height(&coin, height);

        let updated = self.reproject(|item| item.coin_value.coin_code == coin && item.is_confirming());
        debug!(coin = %coin, height, updated, "Block height updated");
        self.react()
    }

    /// Résultat d'un Command::FetchRate
    pub fn rate_fetched(&mut self, coin: &str, currency: &str, date: NaiveDate, result: Result<Decimal>) -> Reaction {
        self.rate_requests
            .remove(&(coin.to_string(), currency.to_string(), date));

        if currency != self.metadata.currency().code {
            debug!(coin, currency, "Rate for previous base currency ignored");
            return self.react();
        }

        match result {
            Ok(rate) => {
                self.metadata.set_rate(coin, date, rate);
                let updated = self.reproject(|item| item.coin_value.coin_code == coin && item.date == date);
                debug!(coin, %date, %rate, updated, "Rate received");
            }
            // L'item reste "rate pending" ; un prochain item_will_be_shown relancera
            Err(err) => warn!(coin, %date, error = %err, "Rate fetch failed"),
        }
        self.react()
    }

    /// L'UI va afficher cet item : demande son taux s'il manque
    pub fn item_will_be_shown(&mut self, uid: &str) -> Reaction {
        let Some(entry) = self.entries.iter().find(|entry| entry.item.uid == uid) else {
            debug!(uid, "item_will_be_shown for unknown uid");
            return self.react();
        };

        if entry.item.rate_pending() {
            let key = (
                entry.item.coin_value.coin_code.clone(),
                self.metadata.currency().code.clone(),
                entry.item.date,
            );
            if self.rate_requests.insert(key.clone()) {
                let (coin, currency, date) = key;
                self.commands.push(Command::FetchRate { coin, currency, date });
            }
        }
        self.react()
    }

    /// Change la devise de référence : tous les taux sont oubliés
    pub fn set_base_currency(&mut self, currency: Currency) -> Reaction {
        if currency == *self.metadata.currency() {
            return self.react();
        }

        info!(currency = %currency.code, "Base currency changed");
        self.metadata.clear_rates(currency);
        self.rate_requests.clear();
        self.reproject(|_| true);
        self.react()
    }

    /// Reconstruit tous les items affichés
    pub fn refresh_all(&mut self) -> Reaction {
        self.projector.clear();
        self.reproject(|_| true);
        self.react()
    }

    pub fn delete_account(&mut self, account_id: &str) -> Reaction {
        info!(account_id, "Account deleted");
        self.repo.handle_deleted_account(account_id);
        self.wallets.retain(|key, _| key.account_id != account_id);
        self.drop_stale_filter();
        self.restart();
        self.react()
    }

    // ========================================================================
    // Interne
    // ========================================================================

    fn drop_stale_filter(&mut self) {
        if let Some(wallet) = &self.filter {
            if !self.wallets.contains_key(wallet) {
                info!(wallet = %wallet, "Filtered wallet removed, showing all wallets");
                self.filter = None;
            }
        }
    }

    /// Nouvelle session de pagination : les records affichés retournent dans leurs pools
    fn restart(&mut self) {
        let mut returned: BTreeMap<WalletKey, Vec<TransactionRecord>> = BTreeMap::new();
        for entry in self.entries.drain(..) {
            returned
                .entry(entry.record.wallet.clone())
                .or_default()
                .push(entry.record);
        }

        for (wallet, records) in returned {
            match self.repo.pool_mut(&wallet) {
                Some(pool) => pool.put_back(records),
                None => {
                    for record in &records {
                        self.projector.forget(&record.uid);
                    }
                }
            }
        }

        let scope: Vec<WalletKey> = match &self.filter {
            Some(wallet) => vec![wallet.clone()],
            None => self.repo.wallets().cloned().collect(),
        };
        self.loader = MergeLoader::new(scope, self.settings.fetch_limit);
        self.target = self.settings.page_size.max(1);
        self.done = false;
        self.state = LoadState::LoadingInitial;
        self.fill();
    }

    /// Complète la liste jusqu'à la cible, plus les records arrivés plus récents que la queue
    fn fill(&mut self) {
        if self.state == LoadState::Idle {
            return;
        }

        let count = self.target.saturating_sub(self.entries.len()) + self.catch_up_count();
        if count > 0 {
            let result = self.loader.load_next(&mut self.repo, count);
            self.commands
                .extend(result.fetches.into_iter().map(Command::Fetch));
            self.insert_entries(result.records);
        }

        self.done = self.loader.is_done(&self.repo);

        let loading = matches!(self.state, LoadState::LoadingInitial | LoadState::LoadingMore);
        if loading
            && (self.entries.len() >= self.target || self.done || !self.loader.is_fetching(&self.repo))
        {
            debug!(shown = self.entries.len(), done = self.done, "Page ready");
            self.state = LoadState::Ready;
        }
    }

    /// Records en attente plus récents que le dernier affiché (source revenue d'un échec)
    fn catch_up_count(&self) -> usize {
        let Some(tail) = self.entries.last() else {
            return 0;
        };
        let key = tail.record.sort_key();

        self.loader
            .scope()
            .iter()
            .filter_map(|wallet| self.repo.pool(wallet))
            .map(|pool| pool.records().filter(|record| record.sort_key() > key).count())
            .sum()
    }

    fn fetch_now(&mut self, wallet: &WalletKey) {
        let Some(pool) = self.repo.pool_mut(wallet) else {
            return;
        };
        if pool.can_fetch() {
            pool.begin_fetch();
            self.commands.push(Command::Fetch(FetchRequest {
                wallet: wallet.clone(),
                generation: pool.generation(),
                cursor: pool.cursor().cloned(),
                limit: self.settings.fetch_limit.max(1),
            }));
        }
    }

    fn insert_entries(&mut self, records: Vec<TransactionRecord>) {
        if records.is_empty() {
            return;
        }
        for record in records {
            match self.project(&record) {
                Some(item) => self.entries.push(Entry { record, item }),
                None => debug!(uid = %record.uid, "Record of unknown wallet dropped"),
            }
        }
        self.entries
            .sort_by(|a, b| newest_first(&a.record, &b.record));
    }

    fn project(&mut self, record: &TransactionRecord) -> Option<ViewItem> {
        let coin = self.wallets.get(&record.wallet)?.coin.clone();
        let date = record.date_bucket();

        if self.metadata.rate(&coin.code, date).is_none() {
            let currency = &self.metadata.currency().code;
            if let Some(rate) = self.rates.cached_rate(&coin.code, currency, date) {
                self.metadata.set_rate(&coin.code, date, rate);
            }
        }

        let snapshot = self.metadata.snapshot(&coin.code, date);
        Some(self.projector.project(record, &coin, &snapshot))
    }

    /// Reconstruit les items sélectionnés ; retourne le nombre d'items reprojetés
    fn reproject(&mut self, affected: impl Fn(&ViewItem) -> bool) -> usize {
        let mut count = 0;
        for index in 0..self.entries.len() {
            if !affected(&self.entries[index].item) {
                continue;
            }
            let record = self.entries[index].record.clone();
            if let Some(item) = self.project(&record) {
                self.entries[index].item = item;
                count += 1;
            }
        }
        count
    }

    /// Vide les commandes en attente et publie l'état si quelque chose a changé
    fn react(&mut self) -> Reaction {
        let commands = std::mem::take(&mut self.commands);

        let items: Vec<ViewItem> = self.entries.iter().map(|entry| entry.item.clone()).collect();
        let status = self.status();
        let script = diff(&self.published, &items);

        let update = if script.is_empty() && self.published_status == Some(status) {
            None
        } else {
            self.published = items.clone();
            self.published_status = Some(status);
            Some(ListUpdate {
                items,
                diff: script,
                status,
            })
        };

        Reaction { commands, update }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Change;
    use crate::models::{Coin, CoinKind, TransactionStatus};
    use crate::sources::MemoryRateProvider;
    use std::collections::{HashMap, VecDeque};

    // ------------------------------------------------------------------------
    // Harness : exécute les Command::Fetch de façon synchrone contre des
    // historiques en mémoire et vérifie chaque diff publié
    // ------------------------------------------------------------------------

    struct Harness {
        orchestrator: TransactionsOrchestrator,
        rates: Arc<MemoryRateProvider>,
        chains: HashMap<WalletKey, Vec<TransactionRecord>>,
        failing: HashSet<WalletKey>,
        /// Sources qui renvoient toujours leur première page
        ignoring_cursor: HashSet<WalletKey>,
        fetches: HashMap<WalletKey, usize>,
        /// Commandes autres que Fetch, laissées au test
        pending: Vec<Command>,
        shown: Vec<ViewItem>,
        last_status: Option<ListStatus>,
        last_diff: Option<EditScript<ViewItem>>,
    }

    impl Harness {
        fn new(settings: Settings) -> Self {
            let rates = Arc::new(MemoryRateProvider::new());
            Self {
                orchestrator: TransactionsOrchestrator::new(settings, rates.clone()),
                rates,
                chains: HashMap::new(),
                failing: HashSet::new(),
                ignoring_cursor: HashSet::new(),
                fetches: HashMap::new(),
                pending: Vec::new(),
                shown: Vec::new(),
                last_status: None,
                last_diff: None,
            }
        }

        fn add_wallet(&mut self, wallet: &Wallet, timestamps: &[i64]) {
            let mut records: Vec<TransactionRecord> =
                timestamps.iter().map(|ts| record(&wallet.key, *ts)).collect();
            records.sort_by(newest_first);
            self.chains.insert(wallet.key.clone(), records);
        }

        fn start(&mut self, wallets: &[Wallet]) {
            let setups = wallets.iter().map(|wallet| setup(wallet, 3, None)).collect();
            let reaction = self.orchestrator.set_wallets(setups);
            self.absorb(reaction);
        }

        fn absorb(&mut self, reaction: Reaction) {
            let mut queue: VecDeque<Command> = reaction.commands.into();
            self.record_update(reaction.update);

            while let Some(command) = queue.pop_front() {
                match command {
                    Command::Fetch(request) => {
                        *self.fetches.entry(request.wallet.clone()).or_default() += 1;
                        let result = self.serve(&request);
                        let reaction = self.orchestrator.fetch_completed(request, result);
                        queue.extend(reaction.commands);
                        self.record_update(reaction.update);
                    }
                    other => self.pending.push(other),
                }
            }
        }

        fn serve(&self, request: &FetchRequest) -> Result<Vec<TransactionRecord>> {
            if self.failing.contains(&request.wallet) {
                anyhow::bail!("{} unreachable", request.wallet);
            }
            let chain = self.chains.get(&request.wallet).cloned().unwrap_or_default();
            let cursor = if self.ignoring_cursor.contains(&request.wallet) {
                None
            } else {
                request.cursor.as_ref()
            };
            Ok(chain
                .into_iter()
                .filter(|record| cursor.map_or(true, |cursor| cursor.is_before(record)))
                .take(request.limit)
                .collect())
        }

        fn record_update(&mut self, update: Option<ListUpdate>) {
            if let Some(update) = update {
                assert_eq!(update.diff.apply(&self.shown), update.items);
                self.shown = update.items;
                self.last_status = Some(update.status);
                self.last_diff = Some(update.diff);
            }
        }

        fn timestamps(&self) -> Vec<i64> {
            self.shown.iter().map(|item| item.timestamp).collect()
        }

        fn total_fetches(&self) -> usize {
            self.fetches.values().sum()
        }
    }

    fn wallet(account: &str, code: &str) -> Wallet {
        Wallet::new(account, Coin::new(code, code, 8, CoinKind::Bitcoin))
    }

    fn record(wallet: &WalletKey, ts: i64) -> TransactionRecord {
        let hash = format!("{}-{}-{}", wallet.account_id, wallet.coin_code, ts);
        TransactionRecord::new(wallet.clone(), &hash, 0, ts, Decimal::ONE)
    }

    fn setup(wallet: &Wallet, threshold: u32, height: Option<u64>) -> WalletSetup {
        WalletSetup {
            wallet: wallet.clone(),
            confirmation_threshold: threshold,
            last_block_height: height,
        }
    }

    fn settings(page_size: usize, fetch_limit: usize) -> Settings {
        Settings {
            page_size,
            fetch_limit,
            ..Settings::default()
        }
    }

    fn is_sorted_desc(stamps: &[i64]) -> bool {
        stamps.windows(2).all(|pair| pair[0] > pair[1])
    }

    // ------------------------------------------------------------------------
    // Pagination
    // ------------------------------------------------------------------------

    #[test]
    fn test_initial_page_in_global_order() {
        let btc = wallet("a", "BTC");
        let eth = wallet("a", "ETH");
        let mut harness = Harness::new(settings(10, 5));
        harness.add_wallet(&btc, &(1..=15).map(|n| n * 2).collect::<Vec<_>>());
        harness.add_wallet(&eth, &(1..=15).map(|n| n * 2 - 1).collect::<Vec<_>>());

        harness.start(&[btc, eth]);

        assert_eq!(harness.timestamps(), (21..=30).rev().collect::<Vec<_>>());
        assert_eq!(harness.last_status, Some(ListStatus::Ready));
        assert_eq!(harness.orchestrator.state(), LoadState::Ready);
    }

    #[test]
    fn test_load_more_until_done() {
        let btc = wallet("a", "BTC");
        let eth = wallet("a", "ETH");
        let mut harness = Harness::new(settings(4, 3));
        harness.add_wallet(&btc, &[1, 3, 5, 7, 9]);
        harness.add_wallet(&eth, &[2, 4, 6]);
        harness.start(&[btc, eth]);
        assert_eq!(harness.timestamps(), vec![9, 7, 6, 5]);

        for _ in 0..5 {
            let reaction = harness.orchestrator.load_more();
            harness.absorb(reaction);
        }

        assert_eq!(harness.timestamps(), vec![9, 7, 6, 5, 4, 3, 2, 1]);
        let fetches = harness.total_fetches();
        let reaction = harness.orchestrator.load_more();
        assert!(reaction.commands.is_empty());
        harness.absorb(reaction);
        assert_eq!(harness.total_fetches(), fetches);
    }

    #[test]
    fn test_load_more_ignored_while_loading() {
        let btc = wallet("a", "BTC");
        let mut orchestrator = TransactionsOrchestrator::new(settings(5, 5), Arc::new(MemoryRateProvider::new()));

        let reaction = orchestrator.set_wallets(vec![setup(&btc, 3, None)]);
        assert_eq!(reaction.commands.len(), 1);
        assert_eq!(reaction.update.map(|update| update.status), Some(ListStatus::Loading));
        assert_eq!(orchestrator.state(), LoadState::LoadingInitial);

        let reaction = orchestrator.load_more();
        assert!(reaction.commands.is_empty());
        assert_eq!(orchestrator.state(), LoadState::LoadingInitial);
    }

    #[test]
    fn test_source_ignoring_cursor_does_not_loop() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(settings(3, 3));
        harness.add_wallet(&btc, &[30, 20, 10]);
        harness.ignoring_cursor.insert(btc.key.clone());
        harness.start(&[btc]);
        assert_eq!(harness.timestamps(), vec![30, 20, 10]);

        let reaction = harness.orchestrator.load_more();
        harness.absorb(reaction);

        assert_eq!(harness.total_fetches(), 2);
        assert_eq!(harness.timestamps(), vec![30, 20, 10]);
        assert_eq!(harness.orchestrator.state(), LoadState::Ready);
        assert_eq!(harness.last_status, Some(ListStatus::Ready));

        let reaction = harness.orchestrator.load_more();
        assert!(reaction.commands.is_empty());
    }

    #[test]
    fn test_same_wallets_keep_loaded_pages() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(settings(3, 3));
        harness.add_wallet(&btc, &(1..=10).collect::<Vec<_>>());
        harness.start(&[btc.clone()]);
        let reaction = harness.orchestrator.load_more();
        harness.absorb(reaction);
        assert_eq!(harness.timestamps(), vec![10, 9, 8, 7, 6, 5]);
        let fetches = harness.total_fetches();

        let reaction = harness.orchestrator.set_wallets(vec![setup(&btc, 3, None)]);
        assert!(reaction.commands.is_empty());
        assert!(reaction.update.is_none());
        assert_eq!(harness.orchestrator.state(), LoadState::Ready);

        // Nouvelle hauteur de bloc : items reconstruits, pas de nouvelle pagination
        let reaction = harness.orchestrator.set_wallets(vec![setup(&btc, 3, Some(100))]);
        harness.absorb(reaction);
        assert_eq!(harness.timestamps(), vec![10, 9, 8, 7, 6, 5]);
        assert_eq!(harness.total_fetches(), fetches);
    }

    #[test]
    fn test_empty_scope() {
        let mut harness = Harness::new(Settings::default());
        harness.start(&[]);
        assert_eq!(harness.last_status, Some(ListStatus::Empty));
        assert!(harness.shown.is_empty());
    }

    #[test]
    fn test_exhausted_sources_without_records() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[]);
        harness.start(&[btc]);
        assert_eq!(harness.last_status, Some(ListStatus::Empty));
    }

    // ------------------------------------------------------------------------
    // Filtre
    // ------------------------------------------------------------------------

    #[test]
    fn test_filter_options() {
        let btc = wallet("a", "BTC");
        let eth = wallet("a", "ETH");
        let mut harness = Harness::new(Settings::default());
        harness.start(&[btc.clone()]);
        assert!(harness.orchestrator.current_filter_options().is_empty());

        harness.start(&[eth.clone(), btc.clone()]);
        assert_eq!(
            harness.orchestrator.current_filter_options(),
            vec![None, Some(btc.key.clone()), Some(eth.key.clone())]
        );
    }

    #[test]
    fn test_filter_change_reuses_pools() {
        let btc = wallet("a", "BTC");
        let eth = wallet("a", "ETH");
        let mut harness = Harness::new(settings(4, 10));
        harness.add_wallet(&btc, &[1, 3, 5, 7, 9]);
        harness.add_wallet(&eth, &[2, 4, 6, 8, 10]);
        harness.start(&[btc.clone(), eth]);
        let all = harness.timestamps();
        assert_eq!(all, vec![10, 9, 8, 7]);
        let fetches = harness.total_fetches();

        let reaction = harness.orchestrator.select_filter(Some(btc.key.clone()));
        harness.absorb(reaction);
        assert_eq!(harness.timestamps(), vec![9, 7, 5, 3]);

        let reaction = harness.orchestrator.select_filter(None);
        harness.absorb(reaction);
        assert_eq!(harness.timestamps(), all);
        assert_eq!(harness.total_fetches(), fetches);
    }

    #[test]
    fn test_filter_on_unknown_wallet_ignored() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[1, 2]);
        harness.start(&[btc]);

        let reaction = harness.orchestrator.select_filter(Some(WalletKey::new("zz", "XYZ")));
        assert!(reaction.update.is_none());
        assert_eq!(harness.orchestrator.filter(), None);
    }

    // ------------------------------------------------------------------------
    // Échecs et générations
    // ------------------------------------------------------------------------

    #[test]
    fn test_partial_failure_then_recovery() {
        let a = wallet("a", "AAA");
        let b = wallet("a", "BBB");
        let c = wallet("a", "CCC");
        let mut harness = Harness::new(settings(6, 10));
        harness.add_wallet(&a, &[30, 27, 24, 21, 18]);
        harness.add_wallet(&b, &[29, 26, 23, 20, 17]);
        harness.add_wallet(&c, &[28, 25, 22, 19, 16]);
        harness.failing.insert(c.key.clone());

        harness.start(&[a, b, c.clone()]);

        assert_eq!(harness.timestamps(), vec![30, 29, 27, 26, 24, 23]);
        assert_eq!(harness.last_status, Some(ListStatus::Partial));

        let retry = harness.pending.pop().unwrap();
        let Command::ScheduleRetry { wallet, generation, delay } = retry else {
            panic!("expected a retry, got {:?}", retry);
        };
        assert_eq!(wallet, c.key);
        assert_eq!(delay, Duration::from_millis(1_000));

        harness.failing.clear();
        let reaction = harness.orchestrator.retry_due(&wallet, generation);
        harness.absorb(reaction);

        assert_eq!(harness.timestamps(), vec![30, 29, 28, 27, 26, 25, 24, 23]);
        assert!(is_sorted_desc(&harness.timestamps()));
        assert_eq!(harness.last_status, Some(ListStatus::Ready));
    }

    #[test]
    fn test_all_sources_failed() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[1, 2]);
        harness.failing.insert(btc.key.clone());
        harness.start(&[btc]);

        assert_eq!(harness.last_status, Some(ListStatus::Failed));
        assert_eq!(harness.orchestrator.state(), LoadState::Ready);
    }

    #[test]
    fn test_backoff_grows_with_failures() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[1]);
        harness.failing.insert(btc.key.clone());
        harness.start(&[btc.clone()]);

        let Some(Command::ScheduleRetry { generation, .. }) = harness.pending.pop() else {
            panic!("expected a retry");
        };
        let reaction = harness.orchestrator.retry_due(&btc.key, generation);
        harness.absorb(reaction);

        let Some(Command::ScheduleRetry { delay, .. }) = harness.pending.pop() else {
            panic!("expected a second retry");
        };
        assert_eq!(delay, Duration::from_millis(2_000));
    }

    #[test]
    fn test_result_for_removed_wallet_discarded() {
        let btc = wallet("a", "BTC");
        let eth = wallet("a", "ETH");
        let mut orchestrator = TransactionsOrchestrator::new(settings(5, 5), Arc::new(MemoryRateProvider::new()));

        let reaction = orchestrator.set_wallets(vec![setup(&btc, 3, None), setup(&eth, 3, None)]);
        let requests: Vec<FetchRequest> = reaction
            .commands
            .into_iter()
            .filter_map(|command| match command {
                Command::Fetch(request) => Some(request),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 2);

        // ETH reste actif et son fetch est toujours en cours : pas de second fetch
        let reaction = orchestrator.set_wallets(vec![setup(&eth, 3, None)]);
        assert!(reaction.commands.is_empty());

        for request in requests {
            let records = vec![record(&request.wallet, 1), record(&request.wallet, 2)];
            orchestrator.fetch_completed(request, Ok(records));
        }

        let wallets: HashSet<WalletKey> = orchestrator.items().iter().map(|item| item.wallet.clone()).collect();
        assert_eq!(wallets, HashSet::from([eth.key.clone()]));
        assert_eq!(orchestrator.items().len(), 2);
    }

    #[test]
    fn test_delete_account() {
        let mine = wallet("a", "BTC");
        let other = wallet("b", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&mine, &[1, 3]);
        harness.add_wallet(&other, &[2, 4]);
        harness.start(&[mine.clone(), other.clone()]);
        let reaction = harness.orchestrator.select_filter(Some(other.key.clone()));
        harness.absorb(reaction);
        assert_eq!(harness.timestamps(), vec![4, 2]);

        let reaction = harness.orchestrator.delete_account("b");
        harness.absorb(reaction);

        assert_eq!(harness.orchestrator.filter(), None);
        assert_eq!(harness.timestamps(), vec![3, 1]);
        assert!(harness.orchestrator.current_filter_options().is_empty());
    }

    // ------------------------------------------------------------------------
    // Métadonnées
    // ------------------------------------------------------------------------

    #[test]
    fn test_block_height_updates_only_confirming_items() {
        let btc = wallet("a", "BTC");
        let mut orchestrator = TransactionsOrchestrator::new(Settings::default(), Arc::new(MemoryRateProvider::new()));
        let reaction = orchestrator.set_wallets(vec![setup(&btc, 6, Some(100))]);
        let Some(Command::Fetch(request)) = reaction.commands.into_iter().next() else {
            panic!("expected a fetch");
        };

        let records = vec![
            record(&btc.key, 20).with_block_height(100),
            record(&btc.key, 10).with_block_height(50),
        ];
        orchestrator.fetch_completed(request, Ok(records));
        assert_eq!(orchestrator.items()[0].status, TransactionStatus::Confirming(1));
        assert_eq!(orchestrator.items()[1].status, TransactionStatus::Confirmed);

        let reaction = orchestrator.block_height_updated(&btc.key, 105);
        let update = reaction.update.unwrap();
        assert_eq!(update.items[0].status, TransactionStatus::Confirmed);
        assert_eq!(update.diff.len(), 1);
        assert!(matches!(update.diff.changes[0], Change::Update { index: 0, .. }));

        // Hauteur déjà connue : rien à publier
        assert!(orchestrator.block_height_updated(&btc.key, 105).update.is_none());
    }

    #[test]
    fn test_rate_requested_once_then_applied() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[86_400]);
        harness.start(&[btc]);

        let item = harness.shown[0].clone();
        assert!(item.rate_pending());
        assert_eq!(item.currency_text, "");

        let reaction = harness.orchestrator.item_will_be_shown(&item.uid);
        assert_eq!(
            reaction.commands,
            vec![Command::FetchRate {
                coin: "BTC".to_string(),
                currency: "USD".to_string(),
                date: item.date,
            }]
        );
        assert!(harness.orchestrator.item_will_be_shown(&item.uid).commands.is_empty());

        let reaction = harness
            .orchestrator
            .rate_fetched("BTC", "USD", item.date, Ok(Decimal::new(42_000, 0)));
        harness.absorb(reaction);

        assert_eq!(harness.shown[0].currency_text, "$42000.00");
        assert!(!harness.shown[0].rate_pending());
        assert!(matches!(
            harness.last_diff.as_ref().unwrap().changes[..],
            [Change::Update { index: 0, .. }]
        ));
    }

    #[test]
    fn test_cached_rate_used_without_fetch() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        let day = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        harness.rates.set_cached_rate("BTC", "USD", day, Decimal::TWO);
        harness.add_wallet(&btc, &[60]);
        harness.start(&[btc]);

        let item = harness.shown[0].clone();
        assert!(!item.rate_pending());
        assert!(harness.orchestrator.item_will_be_shown(&item.uid).commands.is_empty());
        assert_eq!(harness.rates.fetch_count(), 0);
    }

    #[test]
    fn test_failed_rate_fetch_can_be_retried() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[60]);
        harness.start(&[btc]);
        let item = harness.shown[0].clone();

        harness.orchestrator.item_will_be_shown(&item.uid);
        let reaction = harness
            .orchestrator
            .rate_fetched("BTC", "USD", item.date, Err(anyhow::anyhow!("timeout")));
        assert!(reaction.update.is_none());

        assert_eq!(harness.orchestrator.item_will_be_shown(&item.uid).commands.len(), 1);
    }

    #[test]
    fn test_base_currency_change_clears_rates() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[60]);
        harness.start(&[btc]);
        let item = harness.shown[0].clone();
        let reaction = harness
            .orchestrator
            .rate_fetched("BTC", "USD", item.date, Ok(Decimal::TEN));
        harness.absorb(reaction);
        assert_eq!(harness.shown[0].currency_text, "$10.00");

        let euro = Currency::new("EUR", "€", 2);
        let reaction = harness.orchestrator.set_base_currency(euro);
        harness.absorb(reaction);
        assert!(harness.shown[0].rate_pending());

        // Taux en dollars arrivé trop tard
        let reaction = harness
            .orchestrator
            .rate_fetched("BTC", "USD", item.date, Ok(Decimal::TEN));
        assert!(reaction.update.is_none());

        let reaction = harness
            .orchestrator
            .rate_fetched("BTC", "EUR", item.date, Ok(Decimal::TWO));
        harness.absorb(reaction);
        assert_eq!(harness.shown[0].currency_text, "€2.00");
    }

    #[test]
    fn test_refresh_all_without_changes_publishes_nothing() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[1, 2, 3]);
        harness.start(&[btc]);

        assert!(harness.orchestrator.refresh_all().update.is_none());
    }

    // ------------------------------------------------------------------------
    // Records poussés
    // ------------------------------------------------------------------------

    #[test]
    fn test_pushed_newer_record_inserted_at_top() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(settings(3, 3));
        harness.add_wallet(&btc, &(1..=10).collect::<Vec<_>>());
        harness.start(&[btc.clone()]);
        assert_eq!(harness.timestamps(), vec![10, 9, 8]);

        let reaction = harness
            .orchestrator
            .transactions_updated(&btc.key, vec![record(&btc.key, 100)]);
        harness.absorb(reaction);

        assert_eq!(harness.timestamps(), vec![100, 10, 9, 8]);
        assert!(matches!(
            harness.last_diff.as_ref().unwrap().changes[..],
            [Change::Insert { index: 0, .. }]
        ));
    }

    #[test]
    fn test_pushed_older_record_waits_for_its_page() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(settings(3, 3));
        harness.add_wallet(&btc, &(10..=20).collect::<Vec<_>>());
        harness.start(&[btc.clone()]);

        // La source connaît le record : il arrivera aussi avec sa page
        let pushed = record(&btc.key, 5);
        if let Some(chain) = harness.chains.get_mut(&btc.key) {
            chain.push(pushed.clone());
        }
        let reaction = harness.orchestrator.transactions_updated(&btc.key, vec![pushed]);
        assert!(reaction.update.is_none());
        assert_eq!(harness.timestamps(), vec![20, 19, 18]);

        for _ in 0..5 {
            let reaction = harness.orchestrator.load_more();
            harness.absorb(reaction);
        }
        assert_eq!(harness.timestamps().last(), Some(&5));
        assert!(is_sorted_desc(&harness.timestamps()));
    }

    #[test]
    fn test_pushed_record_when_fully_loaded() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[10, 20]);
        harness.start(&[btc.clone()]);

        let reaction = harness
            .orchestrator
            .transactions_updated(&btc.key, vec![record(&btc.key, 5)]);
        harness.absorb(reaction);
        assert_eq!(harness.timestamps(), vec![20, 10, 5]);
    }

    #[test]
    fn test_pushed_update_replaces_shown_item() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[10, 20]);
        harness.start(&[btc.clone()]);

        let reaction = harness
            .orchestrator
            .transactions_updated(&btc.key, vec![record(&btc.key, 10).failed()]);
        harness.absorb(reaction);

        assert_eq!(harness.timestamps(), vec![20, 10]);
        assert_eq!(harness.shown[1].status, TransactionStatus::Failed);
        assert!(matches!(
            harness.last_diff.as_ref().unwrap().changes[..],
            [Change::Update { index: 1, .. }]
        ));
    }

    #[test]
    fn test_old_record_pushed_during_initial_load_keeps_page_size() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(settings(5, 5));
        harness.add_wallet(&btc, &(1..=100).map(|n| n * 10).collect::<Vec<_>>());

        let started = harness.orchestrator.set_wallets(vec![setup(&btc, 3, None)]);
        assert_eq!(harness.orchestrator.state(), LoadState::LoadingInitial);

        let pushed = harness
            .orchestrator
            .transactions_updated(&btc.key, vec![record(&btc.key, 10)]);
        harness.absorb(pushed);
        harness.absorb(started);

        // Première page plus la page suivante préchargée, pas davantage
        assert_eq!(harness.timestamps(), vec![1000, 990, 980, 970, 960]);
        assert_eq!(harness.total_fetches(), 2);
        assert_eq!(harness.orchestrator.state(), LoadState::Ready);

        let reaction = harness.orchestrator.load_more();
        harness.absorb(reaction);
        assert_eq!(harness.timestamps().len(), 10);
        assert_eq!(harness.timestamps().last(), Some(&910));
    }

    #[test]
    fn test_new_record_pushed_during_initial_load_shown_first() {
        let btc = wallet("a", "BTC");
        let mut harness = Harness::new(settings(3, 5));
        harness.add_wallet(&btc, &[10, 20, 30, 40, 50]);

        // Le fetch déjà parti ne contiendra pas ce record
        let started = harness.orchestrator.set_wallets(vec![setup(&btc, 3, None)]);
        let pushed = harness
            .orchestrator
            .transactions_updated(&btc.key, vec![record(&btc.key, 99)]);
        harness.absorb(pushed);
        harness.absorb(started);

        assert_eq!(harness.timestamps(), vec![99, 50, 40]);
        assert_eq!(harness.total_fetches(), 1);
    }

    #[test]
    fn test_pushed_record_for_wallet_outside_filter_never_fetched() {
        let btc = wallet("a", "BTC");
        let eth = wallet("a", "ETH");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[10, 20, 30]);
        harness.add_wallet(&eth, &[5, 15, 25]);

        let started = harness
            .orchestrator
            .set_wallets(vec![setup(&btc, 3, None), setup(&eth, 3, None)]);
        let (btc_fetches, eth_fetches): (Vec<Command>, Vec<Command>) = started
            .commands
            .into_iter()
            .partition(|command| matches!(command, Command::Fetch(request) if request.wallet == btc.key));
        assert_eq!(eth_fetches.len(), 1);

        let reaction = harness.orchestrator.select_filter(Some(btc.key.clone()));
        harness.absorb(reaction);
        harness.absorb(Reaction {
            commands: btc_fetches,
            update: None,
        });
        assert_eq!(harness.timestamps(), vec![30, 20, 10]);

        // ETH n'a encore reçu aucune page
        let reaction = harness
            .orchestrator
            .transactions_updated(&eth.key, vec![record(&eth.key, 40), record(&eth.key, 1)]);
        assert!(reaction.update.is_none());
        assert!(reaction.commands.is_empty());

        let reaction = harness.orchestrator.select_filter(None);
        harness.absorb(reaction);
        harness.absorb(Reaction {
            commands: eth_fetches,
            update: None,
        });

        // Source épuisée : le record ancien poussé n'arrivera par aucune page
        assert_eq!(harness.timestamps(), vec![40, 30, 25, 20, 15, 10, 5, 1]);
        assert_eq!(harness.last_status, Some(ListStatus::Ready));
    }

    #[test]
    fn test_pushed_record_for_unknown_wallet_ignored() {
        let btc = wallet("a", "BTC");
        let other = WalletKey::new("a", "ETH");
        let mut harness = Harness::new(Settings::default());
        harness.add_wallet(&btc, &[10]);
        harness.start(&[btc]);

        let reaction = harness
            .orchestrator
            .transactions_updated(&other, vec![record(&other, 50)]);
        assert!(reaction.update.is_none());
    }
}
