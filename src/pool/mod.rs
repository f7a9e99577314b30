// ============================================================================
// Module : pool
// ============================================================================
// Tampons de pagination par wallet et leur dépôt
// ============================================================================

#[allow(clippy::module_inception)]
pub mod pool;       // Pool : tampon + curseur d'une source
pub mod repository; // PoolRepository : un Pool par wallet actif

pub use pool::Pool;
pub use repository::PoolRepository;
