pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod state;

/// Builds the application state; `LOCAL_STATE_PATH` points at the JSON
/// snapshot for instructor-authored data (unset means purely in-memory).
pub fn build_state() -> anyhow::Result<state::AppState> {
    let local_state_path = std::env::var("LOCAL_STATE_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty());
    Ok(state::AppState::new(local_state_path))
}
