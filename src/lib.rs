// Fabrica: pipeline de producción de novelas largas. Context loading,
// escritura vía LLM inyectado, gates de calidad/canon, rewriter acotado,
// commit transaccional y orquestación de flota.

pub mod model;
pub mod config;
pub mod error;
pub mod heuristics;
pub mod guards;
pub mod llm;
pub mod db;
pub mod factory;

// --- RE-EXPORTS (Facade) ---
pub use crate::config::FactoryConfig;
pub use crate::db::Database;
pub use crate::error::{FactoryError, FactoryResult, WriterError};
pub use crate::factory::{Factory, RunOptions, SessionStatus};

pub const APP_NAME: &str = "Fabrica Story Factory";
