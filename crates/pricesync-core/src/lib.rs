pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod pricing;
pub mod reclaimer;
pub mod reconcile;
pub mod remote;
pub mod service;
pub mod types;

pub use error::{Result, SyncError};
