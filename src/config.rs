// ============================================================================
// Structure : Settings
// ============================================================================
// Paramètres de la liste des transactions. Tous les champs ont une valeur
// par défaut : un fichier JSON partiel (ou absent) suffit.
// ============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::models::Currency;

/// Variable d'environnement pointant vers le fichier de configuration
pub const CONFIG_ENV_VAR: &str = "WALLET_TXFEED_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Records ajoutés à la liste à chaque loadMore
    pub page_size: usize,

    /// Records demandés à un adapter par fetch
    pub fetch_limit: usize,

    /// Premier délai de retry après un fetch en échec
    pub retry_base_delay_ms: u64,

    /// Plafond du backoff exponentiel
    pub retry_max_delay_ms: u64,

    /// Devise de référence des montants convertis
    pub base_currency: Currency,

    /// Capacité du channel des mises à jour vers l'UI
    pub update_channel_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: 20,
            fetch_limit: 20,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            base_currency: Currency::default(),
            update_channel_capacity: 64,
        }
    }
}

impl Settings {
    /// Charge un fichier JSON
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Lecture de la configuration {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Configuration JSON invalide")
    }

    /// Fichier désigné par WALLET_TXFEED_CONFIG, sinon valeurs par défaut
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                let settings = Self::from_file(Path::new(&path))?;
                info!(path = ?path, "Settings loaded");
                Ok(settings)
            }
            None => Ok(Self::default()),
        }
    }

    /// Délai avant la tentative n (1 = premier échec) : base * 2^(n-1), plafonné
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}
