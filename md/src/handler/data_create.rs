use async_trait::async_trait;
use tracing::debug;

use super::steps;
use super::{PacketHandler, ServiceProviderAdapter, WorkOutcome};
use crate::apacket::ActionablePacket;
use crate::error::ServiceError;
use crate::packet::PacketType;

/// `data_account_create` and `data_project_create`: the last packet of a create transaction
///
/// Clears the local service's records of the transaction and confirms with a
/// success ITC.
pub struct DataCreate {
    packet_type: PacketType,
}

impl DataCreate {
    pub fn new(packet_type: PacketType) -> Self {
        Self { packet_type }
    }
}

#[async_trait]
impl PacketHandler for DataCreate {
    fn packet_type(&self) -> PacketType {
        self.packet_type.clone()
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "DataCreate::work: called");
        steps::clear_transaction(adapter, apacket).await?;
        Ok(WorkOutcome::Reply(apacket.create_reply_packet()))
    }
}
