// ============================================================================
// API Client : Yahoo Finance (taux historiques)
// ============================================================================
// Récupère le cours de clôture journalier d'une paire coin/devise
// (ex: BTC-USD) pour servir de taux de change à une date donnée.
//
// CONCEPTS RUST :
// 1. async/await : le fetch ne bloque pas le service
// 2. Serde : désérialisation JSON automatique
// 3. Mutex : cache des taux déjà récupérés, partagé entre tâches
// ============================================================================

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, error, info, instrument};

use crate::sources::RateProvider;

// ============================================================================
// Structures pour parser la réponse JSON de Yahoo Finance
// ============================================================================
// On ne garde que ce qui sert au taux : timestamps + cours de clôture
// ============================================================================

#[derive(Debug, Deserialize)]
struct YahooResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    close: Option<Vec<Option<f64>>>,
}

// ============================================================================
// Fournisseur de taux
// ============================================================================

/// Taux historiques via l'API chart de Yahoo Finance
pub struct YahooRateProvider {
    client: reqwest::Client,
    cache: Mutex<HashMap<(String, String, NaiveDate), Decimal>>,
}

impl YahooRateProvider {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .context("Échec de la création du client HTTP")?;

        Ok(Self {
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl RateProvider for YahooRateProvider {
    fn cached_rate(&self, coin: &str, currency: &str, date: NaiveDate) -> Option<Decimal> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(coin.to_string(), currency.to_string(), date))
            .copied()
    }

    #[instrument(skip(self))]
    async fn fetch_rate(&self, coin: &str, currency: &str, date: NaiveDate) -> Result<Decimal> {
        let url = build_yahoo_url(coin, currency, date)?;
        debug!(url = %url, "Built Yahoo Finance API URL");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Échec de la requête HTTP vers Yahoo Finance")?;

        let status = response.status();
        if !status.is_success() {
            error!(status = %status, "Yahoo Finance returned error status");
            anyhow::bail!("Yahoo Finance a retourné une erreur : HTTP {}", status);
        }

        let yahoo_response: YahooResponse = response
            .json()
            .await
            .context("Échec du parsing JSON de la réponse Yahoo")?;

        let rate = parse_close_rate(yahoo_response, coin, currency)?;

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((coin.to_string(), currency.to_string(), date), rate);

        info!(%rate, "Rate fetched");
        Ok(rate)
    }
}

/// URL d'une bougie journalière couvrant `date` (UTC)
fn build_yahoo_url(coin: &str, currency: &str, date: NaiveDate) -> Result<String> {
    let start = date
        .and_hms_opt(0, 0, 0)
        .context("Date invalide")?
        .and_utc()
        .timestamp();
    let end = start + 24 * 60 * 60;

    Ok(format!(
        "https://query1.finance.yahoo.com/v8/finance/chart/{}-{}?interval=1d&period1={}&period2={}",
        coin.to_uppercase(),
        currency.to_uppercase(),
        start,
        end
    ))
}

/// Extrait le premier cours de clôture de la réponse
fn parse_close_rate(yahoo_response: YahooResponse, coin: &str, currency: &str) -> Result<Decimal> {
    if let Some(error) = yahoo_response.chart.error {
        anyhow::bail!("Yahoo Finance : {}", error);
    }

    let result = yahoo_response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .context("Aucune données retournée par Yahoo Finance")?;

    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .context("Pas de cotation dans la réponse")?;

    let timestamps = result.timestamp.unwrap_or_default();
    debug!(timestamp_count = timestamps.len(), "Received timestamps from Yahoo");

    let close = quote
        .close
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .next()
        .with_context(|| format!("Aucun cours de clôture pour {}-{}", coin, currency))?;

    Decimal::try_from(close).context("Cours de clôture non représentable")
}

// ============================================================================
// Tests unitaires (sans réseau)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_yahoo_url() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let url = build_yahoo_url("btc", "usd", date).unwrap();

        assert!(url.contains("/chart/BTC-USD?"));
        assert!(url.contains("interval=1d"));
        assert!(url.contains("period1=1705276800"));
        assert!(url.contains("period2=1705363200"));
    }

    #[test]
    fn test_parse_close_rate() {
        let json = r#"{
            "chart": {
                "result": [{
                    "meta": { "symbol": "BTC-USD" },
                    "timestamp": [1705276800],
                    "indicators": { "quote": [{ "close": [null, 42000.5] }] }
                }],
                "error": null
            }
        }"#;
        let response: YahooResponse = serde_json::from_str(json).unwrap();
        let rate = parse_close_rate(response, "BTC", "USD").unwrap();
        assert_eq!(rate, Decimal::new(420005, 1));
    }

    #[test]
    fn test_parse_error_response() {
        let json = r#"{ "chart": { "result": null, "error": { "code": "Not Found" } } }"#;
        let response: YahooResponse = serde_json::from_str(json).unwrap();
        assert!(parse_close_rate(response, "XXX", "USD").is_err());
    }
}
