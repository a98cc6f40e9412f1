//! gateway-cloud - cloud connectivity for IoT gateways
//!
//! Connects a gateway to an MQTT broker and multiplexes that single
//! connection between many applications:
//! - `transport`: the broker connection, its lifecycle and session identity
//! - `outbound`: the prioritized, session-aware store-and-forward queue and
//!   the DataService that drains it and keeps the connection alive
//! - `protocol`: the `account/device/appId/appTopic` namespace and payloads
//! - `cloud`: per-application clients and lifecycle certificates
//! - `cloudlet`: request/response applications on control topics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gateway_cloud::config::GatewayConfig;
//! use gateway_cloud::gateway::Gateway;
//! use gateway_cloud::transport::Qos;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_toml_str(
//!     r#"
//! [transport]
//! broker_url = "mqtt://localhost:1883"
//! account_name = "acme"
//!
//! [data]
//! in_flight_policy = "republish"
//! "#,
//! )?;
//!
//! let gateway = Gateway::with_rumqttc(config);
//! gateway.start();
//!
//! let client = gateway.cloud().new_cloud_client("TELEMETRY").await?;
//! client.publish("temperature", b"21.5".to_vec(), Qos::AtLeastOnce, false, 5)?;
//!
//! gateway.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod cloud;
pub mod cloudlet;
pub mod config;
pub mod error;
pub mod gateway;
pub mod listeners;
pub mod observability;
pub mod outbound;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use cloud::{CloudClient, CloudClientListener, CloudService};
pub use cloudlet::{
    Cloudlet, CloudletHandler, CloudletOptions, CloudletRequest, CloudletResponse, ResponseCode,
};
pub use config::*;
pub use error::{CloudError, CloudResult};
pub use gateway::Gateway;
pub use outbound::{DataService, DataServiceListener, InFlightPolicy, OutboundQueue};
pub use protocol::*;
pub use transport::{ConnectionState, Qos, TransportConnection};
