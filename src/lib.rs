pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod index;
pub mod logging;
pub mod output;
pub mod partition;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod products;
pub mod record;
pub mod store;
pub mod transport;
