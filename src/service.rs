// ============================================================================
// Service : boucle d'événements autour de l'orchestrateur
// ============================================================================
// Une seule tâche tokio possède le TransactionsOrchestrator et traite les
// événements un par un (point de mutation unique, pas de Mutex).
//
// FLUX :
// 1. L'UI envoie des commandes via ServiceHandle (channel mpsc)
// 2. Le service les passe à l'orchestrateur, qui répond par une Reaction
// 3. Les commandes de la Reaction (fetch, taux, retry) sont lancées dans des
//    tâches séparées ; leur résultat revient comme un nouvel événement
// 4. Les mises à jour de la liste partent vers l'UI (channel borné)
//
// Par wallet, une tâche "watcher" relaie les nouveaux blocs (watch : seule
// la dernière hauteur compte) et les transactions poussées (broadcast).
//
// CONCEPTS RUST :
// 1. Actor pattern : état privé + boîte aux lettres
// 2. WeakSender : les tâches de fond ne maintiennent pas le service en vie
// 3. tokio::select! : attente simultanée sur plusieurs channels
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::Settings;
use crate::loader::FetchRequest;
use crate::models::{Currency, TransactionRecord, WalletKey};
use crate::orchestrator::{Command, ListUpdate, Reaction, TransactionsOrchestrator, WalletSetup};
use crate::sources::{RateProvider, TransactionSource};

/// Capacité de la boîte aux lettres du service
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Événements traités par la boucle du service
enum ServiceEvent {
    // Depuis l'UI
    SetSources(Vec<Arc<dyn TransactionSource>>),
    SelectFilter(Option<WalletKey>),
    LoadMore,
    ItemWillBeShown(String),
    DeleteAccount(String),
    SetBaseCurrency(Currency),
    Refresh,
    RetryFailed,
    FilterOptions(oneshot::Sender<Vec<Option<WalletKey>>>),

    // Depuis les tâches de fond
    FetchCompleted {
        request: FetchRequest,
        result: Result<Vec<TransactionRecord>>,
    },
    RateFetched {
        coin: String,
        currency: String,
        date: NaiveDate,
        result: Result<Decimal>,
    },
    RetryDue {
        wallet: WalletKey,
        generation: u64,
    },
    BlockHeight {
        wallet: WalletKey,
        height: u64,
    },
    TransactionsUpdated {
        wallet: WalletKey,
        records: Vec<TransactionRecord>,
    },
}

// ============================================================================
// Handle : façade côté UI
// ============================================================================

/// Poignée clonable vers le service ; le service s'arrête quand toutes sont libérées
#[derive(Clone)]
pub struct ServiceHandle {
    events: mpsc::Sender<ServiceEvent>,
}

impl ServiceHandle {
    async fn send(&self, event: ServiceEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("Le service des transactions est arrêté"))
    }

    /// Remplace les adapters actifs (un par wallet)
    pub async fn set_sources(&self, sources: Vec<Arc<dyn TransactionSource>>) -> Result<()> {
        self.send(ServiceEvent::SetSources(sources)).await
    }

    pub async fn select_filter(&self, filter: Option<WalletKey>) -> Result<()> {
        self.send(ServiceEvent::SelectFilter(filter)).await
    }

    pub async fn load_more(&self) -> Result<()> {
        self.send(ServiceEvent::LoadMore).await
    }

    pub async fn item_will_be_shown(&self, uid: &str) -> Result<()> {
        self.send(ServiceEvent::ItemWillBeShown(uid.to_string())).await
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<()> {
        self.send(ServiceEvent::DeleteAccount(account_id.to_string())).await
    }

    pub async fn set_base_currency(&self, currency: Currency) -> Result<()> {
        self.send(ServiceEvent::SetBaseCurrency(currency)).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.send(ServiceEvent::Refresh).await
    }

    /// Relance sans attendre les sources en échec
    pub async fn retry_failed(&self) -> Result<()> {
        self.send(ServiceEvent::RetryFailed).await
    }

    pub async fn filter_options(&self) -> Result<Vec<Option<WalletKey>>> {
        let (reply, options) = oneshot::channel();
        self.send(ServiceEvent::FilterOptions(reply)).await?;
        options.await.context("Le service n'a pas répondu")
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct TransactionsService {
    orchestrator: TransactionsOrchestrator,
    rates: Arc<dyn RateProvider>,

    sources: HashMap<WalletKey, Arc<dyn TransactionSource>>,
    watchers: HashMap<WalletKey, JoinHandle<()>>,
    rate_watcher: Option<JoinHandle<()>>,

    events: mpsc::Receiver<ServiceEvent>,
    sender: mpsc::WeakSender<ServiceEvent>,
    updates: mpsc::Sender<ListUpdate>,
}

impl TransactionsService {
    /// Lance le service sur le runtime courant
    ///
    /// Retourne la poignée de commande et le flux des mises à jour de la liste.
    pub fn spawn(settings: Settings, rates: Arc<dyn RateProvider>) -> (ServiceHandle, mpsc::Receiver<ListUpdate>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (update_tx, update_rx) = mpsc::channel(settings.update_channel_capacity.max(1));

        let sender = event_tx.downgrade();
        let service = Self {
            orchestrator: TransactionsOrchestrator::new(settings, rates.clone()),
            rate_watcher: spawn_rate_watcher(rates.as_ref(), sender.clone()),
            rates,
            sources: HashMap::new(),
            watchers: HashMap::new(),
            events: event_rx,
            sender,
            updates: update_tx,
        };
        tokio::spawn(service.run());

        (ServiceHandle { events: event_tx }, update_rx)
    }

    async fn run(mut self) {
        info!("Transactions service started");

        while let Some(event) = self.events.recv().await {
            let reaction = self.handle(event);
            self.dispatch(reaction).await;
        }

        for (_, watcher) in self.watchers.drain() {
            watcher.abort();
        }
        if let Some(watcher) = self.rate_watcher.take() {
            watcher.abort();
        }
        info!("Transactions service stopped");
    }

    fn handle(&mut self, event: ServiceEvent) -> Reaction {
        match event {
            ServiceEvent::SetSources(sources) => self.set_sources(sources),
            ServiceEvent::SelectFilter(filter) => self.orchestrator.select_filter(filter),
            ServiceEvent::LoadMore => self.orchestrator.load_more(),
            ServiceEvent::ItemWillBeShown(uid) => self.orchestrator.item_will_be_shown(&uid),
            ServiceEvent::DeleteAccount(account_id) => self.delete_account(&account_id),
            ServiceEvent::SetBaseCurrency(currency) => self.orchestrator.set_base_currency(currency),
            ServiceEvent::Refresh => self.orchestrator.refresh_all(),
            ServiceEvent::RetryFailed => self.orchestrator.retry_failed(),
            ServiceEvent::FilterOptions(reply) => {
                // L'appelant a pu abandonner sa requête
                let _ = reply.send(self.orchestrator.current_filter_options());
                Reaction::default()
            }
            ServiceEvent::FetchCompleted { request, result } => {
                self.orchestrator.fetch_completed(request, result)
            }
            ServiceEvent::RateFetched {
                coin,
                currency,
                date,
                result,
            } => self.orchestrator.rate_fetched(&coin, &currency, date, result),
            ServiceEvent::RetryDue { wallet, generation } => {
                self.orchestrator.retry_due(&wallet, generation)
            }
            ServiceEvent::BlockHeight { wallet, height } => {
                self.orchestrator.block_height_updated(&wallet, height)
            }
            ServiceEvent::TransactionsUpdated { wallet, records } => {
                self.orchestrator.transactions_updated(&wallet, records)
            }
        }
    }

    fn set_sources(&mut self, sources: Vec<Arc<dyn TransactionSource>>) -> Reaction {
        let incoming: HashMap<WalletKey, Arc<dyn TransactionSource>> = sources
            .into_iter()
            .map(|source| (source.wallet().key.clone(), source))
            .collect();

        // Watchers des wallets retirés ou dont l'adapter a changé
        let stale: Vec<WalletKey> = self
            .sources
            .iter()
            .filter(|(wallet, source)| {
                incoming
                    .get(*wallet)
                    .map_or(true, |next| !Arc::ptr_eq(next, source))
            })
            .map(|(wallet, _)| wallet.clone())
            .collect();
        for wallet in stale {
            self.stop_watcher(&wallet);
        }

        for (wallet, source) in &incoming {
            if !self.watchers.contains_key(wallet) {
                let watcher = self.spawn_watcher(source.clone());
                self.watchers.insert(wallet.clone(), watcher);
            }
        }

        let setups = incoming
            .values()
            .map(|source| WalletSetup {
                wallet: source.wallet().clone(),
                confirmation_threshold: source.confirmation_threshold(),
                last_block_height: source.current_block_height(),
            })
            .collect();

        self.sources = incoming;
        self.orchestrator.set_wallets(setups)
    }

    fn delete_account(&mut self, account_id: &str) -> Reaction {
        let removed: Vec<WalletKey> = self
            .sources
            .keys()
            .filter(|wallet| wallet.account_id == account_id)
            .cloned()
            .collect();
        for wallet in &removed {
            self.stop_watcher(wallet);
            self.sources.remove(wallet);
        }
        self.orchestrator.delete_account(account_id)
    }

    fn stop_watcher(&mut self, wallet: &WalletKey) {
        if let Some(watcher) = self.watchers.remove(wallet) {
            debug!(wallet = %wallet, "Stopping watcher");
            watcher.abort();
        }
    }

    /// Relaie les nouveaux blocs et les transactions poussées d'un adapter
    fn spawn_watcher(&self, source: Arc<dyn TransactionSource>) -> JoinHandle<()> {
        let wallet = source.wallet().key.clone();
        let sender = self.sender.clone();
        let mut heights = source.block_height_updates();
        let mut pushed = source.transaction_updates();

        let span = info_span!("watcher", wallet = %wallet);
        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        changed = heights.changed() => {
                            if changed.is_err() {
                                debug!("Block height channel closed");
                                break;
                            }
                            let height = *heights.borrow_and_update();
                            match height {
                                Some(height) => ServiceEvent::BlockHeight { wallet: wallet.clone(), height },
                                None => continue,
                            }
                        }
                        received = pushed.recv() => match received {
                            Ok(records) => ServiceEvent::TransactionsUpdated { wallet: wallet.clone(), records },
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Transaction updates lagged behind");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Transaction updates channel closed");
                                break;
                            }
                        },
                    };

                    let Some(sender) = sender.upgrade() else {
                        break;
                    };
                    if sender.send(event).await.is_err() {
                        break;
                    }
                }
            }
            .instrument(span),
        )
    }

    async fn dispatch(&mut self, reaction: Reaction) {
        for command in reaction.commands {
            self.execute(command);
        }

        if let Some(update) = reaction.update {
            debug!(items = update.items.len(), changes = update.diff.len(), status = ?update.status, "Publishing update");
            if self.updates.send(update).await.is_err() {
                debug!("Update receiver dropped");
            }
        }
    }

    /// Lance une commande dans une tâche ; le résultat revient comme événement
    fn execute(&self, command: Command) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };

        match command {
            Command::Fetch(request) => {
                let source = self.sources.get(&request.wallet).cloned();
                let span = info_span!("fetch", wallet = %request.wallet, limit = request.limit);
                tokio::spawn(
                    async move {
                        let result = match source {
                            Some(source) => {
                                source
                                    .fetch_transactions(request.cursor.clone(), request.limit)
                                    .await
                            }
                            None => Err(anyhow!("Aucun adapter pour le wallet {}", request.wallet)),
                        };
                        let _ = sender
                            .send(ServiceEvent::FetchCompleted { request, result })
                            .await;
                    }
                    .instrument(span),
                );
            }
            Command::FetchRate {
                coin,
                currency,
                date,
            } => {
                let rates = self.rates.clone();
                let span = info_span!("rate", coin = %coin, currency = %currency, %date);
                tokio::spawn(
                    async move {
                        let result = rates.fetch_rate(&coin, &currency, date).await;
                        let _ = sender
                            .send(ServiceEvent::RateFetched {
                                coin,
                                currency,
                                date,
                                result,
                            })
                            .await;
                    }
                    .instrument(span),
                );
            }
            Command::ScheduleRetry {
                wallet,
                generation,
                delay,
            } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender
                        .send(ServiceEvent::RetryDue { wallet, generation })
                        .await;
                });
            }
        }
    }
}

/// Relaie les taux publiés spontanément par le service de taux
fn spawn_rate_watcher(
    rates: &dyn RateProvider,
    sender: mpsc::WeakSender<ServiceEvent>,
) -> Option<JoinHandle<()>> {
    let mut updates = rates.rate_updates()?;

    let span = info_span!("rate_watcher");
    let watcher = tokio::spawn(
        async move {
            loop {
                let update = match updates.recv().await {
                    Ok(update) => update,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Rate updates lagged behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Rate updates channel closed");
                        break;
                    }
                };

                let Some(sender) = sender.upgrade() else {
                    break;
                };
                let event = ServiceEvent::RateFetched {
                    coin: update.coin,
                    currency: update.currency,
                    date: update.date,
                    result: Ok(update.rate),
                };
                if sender.send(event).await.is_err() {
                    break;
                }
            }
        }
        .instrument(span),
    );
    Some(watcher)
}
