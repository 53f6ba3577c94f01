pub mod bluetooth;
pub mod config;
pub mod database;
pub mod models;
pub mod retry;
pub mod sync;
pub mod utils;
