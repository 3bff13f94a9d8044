pub mod types;
pub mod database;
pub mod context;
pub mod config;
pub mod date;
pub mod error;
pub mod fault;
pub mod id_generator;
pub mod stats;
