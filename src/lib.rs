pub mod auth;
pub mod checker;
pub mod cli;
pub mod cms;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod export;
pub mod inspection;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod time;
pub mod wal;
pub mod wire;
