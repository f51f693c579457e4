pub mod addons;
pub mod backup;
pub mod command;
pub mod config;
pub mod engine;
pub mod extract;
pub mod gateway;
pub mod history;
pub mod line_source;
pub mod lists;
pub mod monitor;
pub mod properties;
pub mod roster;
pub mod session;
pub mod supervisor;
pub mod version;
