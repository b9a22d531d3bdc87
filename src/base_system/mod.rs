pub mod config;
pub mod context;
pub mod control;
pub mod logging;
