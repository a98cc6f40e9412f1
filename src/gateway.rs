//! Composition root: TransportConnection → DataService → CloudService

use crate::cloud::CloudService;
use crate::config::{GatewayConfig, TransportSection};
use crate::error::CloudResult;
use crate::observability::lifecycle_span;
use crate::outbound::DataService;
use crate::protocol::TopicContext;
use crate::transport::mqtt::RumqttLinkFactory;
use crate::transport::{
    LinkFactory, NoopDecryptor, PasswordDecryptor, StaticSystemInfo, SystemInfo,
    TransportConnection,
};
use std::sync::Arc;
use tracing::{info, Instrument};

/// The assembled connectivity stack
///
/// Dependencies are injected at construction; nothing runs until
/// [`start`](Gateway::start).
pub struct Gateway {
    config: GatewayConfig,
    transport: Arc<TransportConnection>,
    data: Arc<DataService>,
    cloud: CloudService,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        factory: Arc<dyn LinkFactory>,
        system: Arc<dyn SystemInfo>,
        decryptor: Arc<dyn PasswordDecryptor>,
    ) -> Self {
        let context = Arc::new(TopicContext::new());
        let transport = Arc::new(TransportConnection::new(
            &config.transport,
            factory,
            system.clone(),
            decryptor,
            context,
        ));
        let data = Arc::new(DataService::new(&config.data, transport.clone()));
        let cloud = CloudService::new(&config.cloud, data.clone(), system);

        Self {
            config,
            transport,
            data,
            cloud,
        }
    }

    /// Gateway over an arbitrary link, with system facts from `[system]`
    pub fn with_factory(config: GatewayConfig, factory: Arc<dyn LinkFactory>) -> Self {
        let system = Arc::new(StaticSystemInfo::from(&config.system));
        Self::new(config, factory, system, Arc::new(NoopDecryptor))
    }

    /// Gateway talking MQTT v5 through rumqttc
    pub fn with_rumqttc(config: GatewayConfig) -> Self {
        Self::with_factory(config, Arc::new(RumqttLinkFactory))
    }

    /// Start background work; connects when `auto_connect` is set
    pub fn start(&self) {
        self.data.start();
        info!(
            broker_url = %self.config.transport.broker_url,
            auto_connect = self.config.data.auto_connect,
            "Gateway started"
        );
    }

    /// Orderly shutdown: last-gasp certificate, quiesced disconnect, link closed
    pub async fn stop(&self) -> CloudResult<()> {
        async {
            let result = self.data.stop().await;
            self.transport.close().await;
            info!("Gateway stopped");
            result
        }
        .instrument(lifecycle_span!(operation = "stop"))
        .await
    }

    /// Apply new broker settings; the DataService reconnects afterwards
    pub async fn update_transport(&mut self, section: TransportSection) -> CloudResult<()> {
        self.transport.update(&section).await?;
        self.config.transport = section;
        Ok(())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<TransportConnection> {
        &self.transport
    }

    pub fn data(&self) -> &Arc<DataService> {
        &self.data
    }

    pub fn cloud(&self) -> &CloudService {
        &self.cloud
    }
}
