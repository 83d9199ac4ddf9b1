mod api;
pub mod server;
mod websocket;

pub use server::{create_router, start_web_server, WebState};
