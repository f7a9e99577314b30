// ============================================================================
// Wallet TxFeed - Démo
// ============================================================================
// Lance le service de transactions sur des wallets simulés et affiche
// l'évolution de la liste dans le terminal :
// première page, page suivante, nouveau bloc, transaction poussée, filtre.
//
// Usage :
//   wallet-txfeed               taux simulés
//   wallet-txfeed --live-rates  taux historiques Yahoo Finance
//
// CONCEPTS RUST CLÉS :
// 1. Runtime tokio créé à la main (main() reste synchrone)
// 2. Trait objects : Arc<dyn TransactionSource> / Arc<dyn RateProvider>
// 3. Channels : ServiceHandle pour commander, Receiver pour les mises à jour
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use wallet_txfeed::api::YahooRateProvider;
use wallet_txfeed::config::Settings;
use wallet_txfeed::models::{Coin, CoinKind, TransactionAddress, TransactionRecord, ViewItem, Wallet};
use wallet_txfeed::orchestrator::{ListStatus, ListUpdate};
use wallet_txfeed::service::{ServiceHandle, TransactionsService};
use wallet_txfeed::sources::{MemoryRateProvider, MemorySource, RateProvider, TransactionSource};

/// Attente maximale d'une mise à jour de la liste
const UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Initialisation du logging
// ============================================================================
// Les logs vont dans un fichier (le terminal sert à la démo) :
// - Linux : ~/.local/share/wallet-txfeed/logs/wallet-txfeed.log
// - macOS : ~/Library/Application Support/wallet-txfeed/logs/
// - sinon : ./logs
//
// RUST_LOG=wallet_txfeed=trace pour plus de détails
// ============================================================================

fn init_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_dir = dirs::data_local_dir()
        .map(|dir| dir.join("wallet-txfeed").join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"));

    std::fs::create_dir_all(&log_dir).context("Échec de la création du répertoire de logs")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir.clone(), "wallet-txfeed.log");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wallet_txfeed=debug,info".into()),
        )
        .init();

    info!(?log_dir, "Logging initialisé");
    Ok(())
}

fn main() -> Result<()> {
    init_logging().unwrap_or_else(|e| {
        eprintln!("⚠️  Warning: Failed to initialize logging: {}", e);
        eprintln!("   Continuing without logging...");
    });

    let settings = Settings::load()?;
    let live_rates = std::env::args().any(|arg| arg == "--live-rates");
    info!(?settings, live_rates, "Wallet TxFeed starting up");

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_demo(settings, live_rates));

    match &result {
        Ok(_) => info!("Demo finished"),
        Err(e) => error!(error = ?e, "Demo failed"),
    }
    result
}

// ============================================================================
// Scénario
// ============================================================================

async fn run_demo(settings: Settings, live_rates: bool) -> Result<()> {
    let rates: Arc<dyn RateProvider> = if live_rates {
        Arc::new(YahooRateProvider::new()?)
    } else {
        Arc::new(demo_rates())
    };

    let bitcoin = Arc::new(
        demo_source(
            Wallet::new("main", Coin::new("BTC", "Bitcoin", 8, CoinKind::Bitcoin)),
            &[(1_704_100_000, "0.015"), (1_704_300_000, "-0.004"), (1_704_650_000, "0.1")],
        )
        .with_block_height(824_000),
    );
    let ethereum = Arc::new(
        demo_source(
            Wallet::new("main", Coin::new("ETH", "Ethereum", 18, CoinKind::Ethereum)),
            &[(1_704_200_000, "1.25"), (1_704_400_000, "-0.3"), (1_704_700_000, "0.05")],
        )
        .with_block_height(18_900_000),
    );
    let eos = Arc::new(demo_source(
        Wallet::new("savings", Coin::new("EOS", "EOS", 4, CoinKind::Eos)),
        &[(1_704_150_000, "120"), (1_704_500_000, "-15.5")],
    ));

    // Petites pages : la démo n'a que quelques transactions par wallet
    let settings = Settings {
        page_size: settings.page_size.min(4),
        fetch_limit: settings.fetch_limit.min(2),
        ..settings
    };
    let (handle, mut updates) = TransactionsService::spawn(settings, rates);
    let sources: Vec<Arc<dyn TransactionSource>> = vec![bitcoin.clone(), ethereum.clone(), eos.clone()];
    handle.set_sources(sources).await?;

    println!("📜 Première page");
    let update = next_update(&mut updates).await?;
    print_update(&update);
    request_rates(&handle, &update.items).await?;

    println!("\n📜 Page suivante");
    handle.load_more().await?;
    let update = next_update(&mut updates).await?;
    print_update(&update);
    request_rates(&handle, &update.items).await?;

    println!("\n⛏️  Nouveau bloc Bitcoin");
    bitcoin.set_block_height(824_010);
    print_update(&next_update(&mut updates).await?);

    println!("\n📥 Transaction reçue");
    let wallet = bitcoin.wallet().key.clone();
    let incoming = TransactionRecord::new(wallet, "demo-incoming", 0, 1_704_800_000, Decimal::new(25, 3))
        .with_addresses(
            vec![TransactionAddress::new("bc1qsender", false)],
            vec![TransactionAddress::new("bc1qmine", true)],
        );
    bitcoin.push(vec![incoming]);
    print_update(&next_update(&mut updates).await?);

    println!("\n🔎 Filtres disponibles");
    for option in handle.filter_options().await? {
        match option {
            Some(wallet) => println!("  - {}", wallet),
            None => println!("  - tous les wallets"),
        }
    }

    println!("\n🔎 Filtre : EOS uniquement");
    handle.select_filter(Some(eos.wallet().key.clone())).await?;
    print_update(&next_update(&mut updates).await?);

    Ok(())
}

/// Demande le taux des items affichés qui n'en ont pas encore
async fn request_rates(handle: &ServiceHandle, items: &[ViewItem]) -> Result<()> {
    for item in items.iter().filter(|item| item.rate_pending()) {
        handle.item_will_be_shown(&item.uid).await?;
    }
    Ok(())
}

/// Prochaine mise à jour publiée par le service (hors "Loading")
async fn next_update(updates: &mut mpsc::Receiver<ListUpdate>) -> Result<ListUpdate> {
    let mut latest = loop {
        let update = tokio::time::timeout(UPDATE_TIMEOUT, updates.recv())
            .await
            .context("Aucune mise à jour reçue à temps")?
            .context("Le service des transactions s'est arrêté")?;
        if update.status != ListStatus::Loading {
            break update;
        }
    };

    // On ne garde que l'état le plus récent déjà disponible
    while let Ok(next) = updates.try_recv() {
        latest = next;
    }
    Ok(latest)
}

fn print_update(update: &ListUpdate) {
    println!("  statut : {:?}, {} changement(s)", update.status, update.diff.len());
    for item in &update.items {
        println!(
            "  {} {:>20} {:>12}  {:<14} {}",
            item.date,
            item.amount_text,
            item.currency_text,
            format!("{:?}", item.status),
            item.wallet
        );
    }
}

// ============================================================================
// Données simulées
// ============================================================================

fn demo_source(wallet: Wallet, transactions: &[(i64, &str)]) -> MemorySource {
    let records = transactions
        .iter()
        .enumerate()
        .filter_map(|(index, (timestamp, amount))| {
            let amount: Decimal = match amount.parse() {
                Ok(amount) => amount,
                Err(e) => {
                    warn!(%amount, error = %e, "Invalid demo amount");
                    return None;
                }
            };
            let hash = format!("{}-{}", wallet.key, index);
            Some(
                TransactionRecord::new(wallet.key.clone(), &hash, 0, *timestamp, amount)
                    .with_block_height(824_000 - index as u64 * 10)
                    .with_fee(Decimal::new(1, 4)),
            )
        })
        .collect();

    MemorySource::new(wallet, records).with_latency(Duration::from_millis(50))
}

fn demo_rates() -> MemoryRateProvider {
    let rates = MemoryRateProvider::new();
    let first_day = NaiveDate::from_ymd_opt(2024, 1, 1);
    for day in first_day.into_iter().flat_map(|day| day.iter_days().take(14)) {
        rates.set_rate("BTC", "USD", day, Decimal::new(43_250, 0));
        rates.set_rate("ETH", "USD", day, Decimal::new(2_310, 0));
        rates.set_rate("EOS", "USD", day, Decimal::new(92, 2));
    }
    rates
}
