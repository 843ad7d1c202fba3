pub mod gemini;
pub mod http;
pub mod ssh;
mod state;
pub mod tasks;
pub mod transfer;

pub use state::AppState;
