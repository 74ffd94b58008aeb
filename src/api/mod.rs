// src/api/mod.rs

// L'exécuteur HTTP et ses collaborateurs: la table de policy de retry,
// le client par compte et les modèles de réponse de la plateforme.
pub mod client;
pub mod retry;
pub mod types;

pub use client::{QuestClient, RequestOptions};
pub use types::ApiResponse;
