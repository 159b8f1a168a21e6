pub mod server;

pub use server::{cors_headers, AppState, BrokerServer};
