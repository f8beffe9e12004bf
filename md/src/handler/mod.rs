//! Packet handlers
//!
//! One handler per packet type, registered once at startup. A handler walks
//! its type's fixed list of steps; every call to `work()` re-walks the list,
//! skipping steps whose results are already cached in the packet.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

mod account_create;
mod account_status;
pub mod adapter;
mod data_create;
mod person;
mod project_create;
mod project_status;
pub mod steps;

pub use account_create::RequestAccountCreate;
pub use account_status::{RequestAccountInactivate, RequestAccountReactivate};
pub use adapter::ServiceProviderAdapter;
pub use data_create::DataCreate;
pub use person::{RequestPersonMerge, RequestUserModify};
pub use project_create::RequestProjectCreate;
pub use project_status::{RequestProjectInactivate, RequestProjectReactivate};

use crate::apacket::ActionablePacket;
use crate::error::ServiceError;
use crate::packet::{Packet, PacketType};
use crate::task::TaskStatus;

/// Result of one `work()` call
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    /// A step's task is not finished; try again after it changes
    Pending(TaskStatus),
    /// Every step is done; send this reply
    Reply(Packet),
}

#[async_trait]
pub trait PacketHandler: Send + Sync {
    fn packet_type(&self) -> PacketType;

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError>;
}

/// Copy packet body fields into a reply, skipping absent ones
pub(crate) fn copy_fields(reply: &mut Packet, apacket: &ActionablePacket, names: &[&str]) {
    for name in names {
        if let Some(value) = apacket.field(name) {
            reply.set(name, value.clone());
        }
    }
}

/// Answers any packet type without a registered handler
pub struct DefaultHandler;

#[async_trait]
impl PacketHandler for DefaultHandler {
    fn packet_type(&self) -> PacketType {
        PacketType::Other("default".to_string())
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        _adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "DefaultHandler::work: called");
        let message = format!("{} not implemented", apacket.packet_type());
        Ok(WorkOutcome::Reply(apacket.create_failure_reply_packet(&message)))
    }
}

/// Static packet type to handler table
pub struct HandlerRegistry {
    handlers: HashMap<PacketType, Box<dyn PacketHandler>>,
    default: DefaultHandler,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default: DefaultHandler,
        }
    }

    /// Registry with every handler this mediator ships
    pub fn with_defaults() -> Self {
        debug!("HandlerRegistry::with_defaults: called");
        let mut registry = Self::new();
        registry.register(Box::new(RequestAccountCreate));
        registry.register(Box::new(RequestProjectCreate));
        registry.register(Box::new(RequestAccountInactivate));
        registry.register(Box::new(RequestAccountReactivate));
        registry.register(Box::new(RequestProjectInactivate));
        registry.register(Box::new(RequestProjectReactivate));
        registry.register(Box::new(RequestUserModify));
        registry.register(Box::new(RequestPersonMerge));
        registry.register(Box::new(DataCreate::new(PacketType::DataAccountCreate)));
        registry.register(Box::new(DataCreate::new(PacketType::DataProjectCreate)));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn PacketHandler>) {
        self.handlers.insert(handler.packet_type(), handler);
    }

    pub fn get(&self, packet_type: &PacketType) -> &dyn PacketHandler {
        match self.handlers.get(packet_type) {
            Some(handler) => handler.as_ref(),
            None => &self.default,
        }
    }

    pub fn is_registered(&self, packet_type: &PacketType) -> bool {
        self.handlers.contains_key(packet_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::fixtures::header;
    use crate::provider::mock::ScriptedLocalService;
    use std::sync::Arc;

    #[test]
    fn test_registry_covers_request_types() {
        let registry = HandlerRegistry::with_defaults();
        for t in [
            PacketType::RequestAccountCreate,
            PacketType::RequestProjectCreate,
            PacketType::RequestAccountInactivate,
            PacketType::RequestAccountReactivate,
            PacketType::RequestProjectInactivate,
            PacketType::RequestProjectReactivate,
            PacketType::RequestUserModify,
            PacketType::RequestPersonMerge,
            PacketType::DataAccountCreate,
            PacketType::DataProjectCreate,
        ] {
            assert!(registry.is_registered(&t), "{} has no handler", t);
            assert_eq!(registry.get(&t).packet_type(), t);
        }
        assert!(!registry.is_registered(&PacketType::NotifyAccountCreate));
    }

    #[tokio::test]
    async fn test_unknown_type_gets_failure_reply() {
        let local = Arc::new(ScriptedLocalService::new());
        let adapter = testing::adapter(&local);
        let registry = HandlerRegistry::with_defaults();
        let packet = Packet::new(PacketType::from("request_mystery"), header(7, 2, 99));
        let mut ap = ActionablePacket::new(packet, None).unwrap();

        let outcome = registry.get(ap.packet_type()).work(&mut ap, &adapter).await.unwrap();
        match outcome {
            WorkOutcome::Reply(reply) => {
                assert!(reply.packet_type.is_itc());
                assert_eq!(reply.get("StatusCode"), Some(&serde_json::json!("Failed")));
                assert_eq!(
                    reply.get("Message"),
                    Some(&serde_json::json!("request_mystery not implemented"))
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(local.submit_count(), 0);
    }
}
