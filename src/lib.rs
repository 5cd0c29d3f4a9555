pub mod cache;
pub mod config;
pub mod context;
pub mod dns_query;
pub mod dns_server;
pub mod matcher;
pub mod pipe_socks;
pub mod proto_utils;
pub mod querier;
pub mod records;
pub mod watcher;
