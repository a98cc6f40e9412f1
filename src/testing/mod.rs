//! Test doubles for the connectivity stack
//!
//! An in-memory broker link and link factory, static system facts,
//! recording listeners for every fan-out point and an `eventually`
//! polling helper, so services can be exercised without a broker.
//!
//! ```rust
//! use gateway_cloud::config::GatewayConfig;
//! use gateway_cloud::gateway::Gateway;
//! use gateway_cloud::testing::MockLinkFactory;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = GatewayConfig::from_toml_str(
//!     r#"
//! [transport]
//! broker_url = "mqtt://localhost:1883"
//! account_name = "acme"
//! client_id = "gw-1"
//!
//! [data]
//! in_flight_policy = "drop"
//! auto_connect = false
//! "#,
//! )
//! .unwrap();
//! let factory = Arc::new(MockLinkFactory::new());
//! let gateway = Gateway::with_factory(config, factory.clone());
//!
//! gateway.start();
//! gateway.data().connect().await.unwrap();
//! assert!(factory.link().is_connected());
//! gateway.stop().await.unwrap();
//! # });
//! ```

pub mod mocks;

pub use mocks::*;
