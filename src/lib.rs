//! Toolgate - launch containerized web tools on demand and reverse-proxy to them
//!
//! This library provides:
//! - A container engine abstraction with a Docker backend
//! - A launcher that starts containers from declarative specs while keeping
//!   their memory reservations within a budget, evicting least recently used
//!   containers when needed
//! - A per-container access historian that drives that eviction order
//! - A reverse proxy that maps `/docker/<name>/...` (or `<name>.<suffix>`)
//!   to the container and shows a self-refreshing "please wait" page while
//!   it starts up

pub mod admin;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod historian;
pub mod host_files;
pub mod launcher;
pub mod pool;
pub mod proxy;
pub mod routing;
