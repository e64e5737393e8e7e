pub mod app_service;
pub mod app_state;
pub mod backtest;
pub mod bundle;
pub mod commands;
pub mod config;
pub mod error;
pub mod storage;
pub mod strategy;

pub use app_state::{AppEvent, AppState};
