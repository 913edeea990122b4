pub mod event_log;
pub mod models;
pub mod reconnect;
pub mod settings;
