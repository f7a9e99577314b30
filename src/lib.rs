// ============================================================================
// Wallet TxFeed - Library
// ============================================================================
// Liste unifiée des transactions de tous les wallets : pagination fusionnée,
// projection en ViewItems et diff incrémental vers l'UI
// ============================================================================

pub mod api;          // Fournisseur de taux HTTP (Yahoo Finance)
pub mod config;       // Paramètres (fichier JSON optionnel)
pub mod diff;         // Script d'édition entre deux listes
pub mod loader;       // Fusion k-way des pools
pub mod metadata;     // Hauteurs de bloc, seuils, taux
pub mod models;       // Structures de données
pub mod orchestrator; // State machine de la liste
pub mod pool;         // Buffers par wallet
pub mod projector;    // Record → ViewItem
pub mod service;      // Boucle tokio autour de l'orchestrateur
pub mod sources;      // Capacités des adapters et du service de taux
