//! HTTP health endpoint.

mod server;
mod state;

pub use server::start_http_server;
pub use state::ApiState;
