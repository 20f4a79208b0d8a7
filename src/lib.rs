pub mod app;
pub mod arima;
pub mod assemble;
pub mod backfill;
pub mod config;
pub mod display;
pub mod domain;
pub mod error;
pub mod export;
pub mod feeds;
pub mod forecast;
pub mod ingest;
pub mod output;
pub mod reference;
pub mod resolve;
pub mod store;
