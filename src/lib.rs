pub mod aggregate;
pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod cost;
pub mod decoder;
pub mod dispatcher;
pub mod lifecycle;
pub mod model;
pub mod notifier;
pub mod parser;
pub mod process_guard;
pub mod scheduler;
pub mod util;
pub mod worker;
