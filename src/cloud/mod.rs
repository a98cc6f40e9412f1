//! Per-application clients multiplexed over the shared DataService

pub mod client;
pub mod listener;
pub mod service;

pub use client::CloudClient;
pub use listener::CloudClientListener;
pub use service::CloudService;
