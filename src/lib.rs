//! Durable job queue for qBittorrent rule runs: storage backends, the worker
//! that drains them, and the HTTP control API in front of both.

pub mod client;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod id;
pub mod paths;
pub mod queue;
pub mod worker;
