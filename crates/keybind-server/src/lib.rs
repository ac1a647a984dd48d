pub mod auth;
pub mod clock;
pub mod engine;
pub mod handlers;
pub mod server;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub engine: engine::Engine,
    /// Time source for key creation; the engine carries its own handle.
    pub clock: Arc<dyn clock::Clock>,
    /// Optional bearer token protecting the owner API.
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(store: store::Store, api_key: Option<String>) -> Self {
        Self::with_clock(store, api_key, Arc::new(clock::SystemClock))
    }

    pub fn with_clock(
        store: store::Store,
        api_key: Option<String>,
        clock: Arc<dyn clock::Clock>,
    ) -> Self {
        let engine = engine::Engine::with_clock(Arc::new(store.clone()), clock.clone());
        Self {
            store,
            engine,
            clock,
            api_key,
        }
    }
}

pub use engine::{Engine, Outcome};
pub use server::{read_key_file, resolve_api_key, resolve_data_dir, router, run, ServerConfig};
