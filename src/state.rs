use std::sync::Arc;

use anyhow::Result;

use crate::{
    auth::jwt::JwtService,
    bus::PubSub,
    config::AppConfig,
    gateway::Gateway,
    services::{MessageService, PresenceService},
    store::{ChatStore, UserDirectory},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jwt: JwtService,
    pub messages: Arc<MessageService>,
    pub presence: Arc<PresenceService>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Wires the services and the gateway over the given store and bus.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ChatStore>,
        directory: Arc<dyn UserDirectory>,
        bus: Arc<dyn PubSub>,
    ) -> Result<Self> {
        let jwt = JwtService::from_config(&config)?;
        let messages = Arc::new(MessageService::new(
            store.clone(),
            directory,
            bus.clone(),
        ));
        let presence = Arc::new(PresenceService::new(store, bus.clone()));
        let gateway = Arc::new(Gateway::new(
            bus,
            messages.clone(),
            presence.clone(),
            config.ws_send_queue_capacity,
        ));

        Ok(Self {
            config: Arc::new(config),
            jwt,
            messages,
            presence,
            gateway,
        })
    }
}
