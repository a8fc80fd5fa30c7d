pub mod compensation;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod notify;
pub mod pipeline;
pub mod state;
pub mod status;
pub mod store;
pub mod terminal;
pub mod transport;
