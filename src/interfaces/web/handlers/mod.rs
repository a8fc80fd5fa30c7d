pub mod alerts;
pub mod events;
pub mod status;
