// ============================================================================
// Module : api
// ============================================================================
// Clients HTTP implémentant les capacités de `sources`
// ============================================================================

pub mod yahoo;  // Taux historiques Yahoo Finance

pub use yahoo::YahooRateProvider;
