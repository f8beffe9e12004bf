use async_trait::async_trait;
use serde_json::Map;
use tracing::debug;

use super::steps;
use super::{PacketHandler, ServiceProviderAdapter, WorkOutcome, copy_fields};
use crate::apacket::ActionablePacket;
use crate::error::ServiceError;
use crate::packet::PacketType;
use crate::request::Operation;

/// `request_user_modify`: replace or delete a person's details
pub struct RequestUserModify;

#[async_trait]
impl PacketHandler for RequestUserModify {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestUserModify
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "RequestUserModify::work: called");

        let pending =
            steps::run_flagged(adapter, apacket, Operation::ModifyUser, None, Map::new(), |r| &mut r.user_modified)
                .await?;
        if let Some(status) = pending {
            return Ok(WorkOutcome::Pending(status));
        }

        let mut reply = apacket.create_reply_packet();
        copy_fields(&mut reply, apacket, &["ActionType", "PersonID"]);
        Ok(WorkOutcome::Reply(reply))
    }
}

/// `request_person_merge`: fold one person record into another
pub struct RequestPersonMerge;

#[async_trait]
impl PacketHandler for RequestPersonMerge {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestPersonMerge
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "RequestPersonMerge::work: called");

        let pending =
            steps::run_flagged(adapter, apacket, Operation::MergePerson, None, Map::new(), |r| &mut r.person_merged)
                .await?;
        if let Some(status) = pending {
            return Ok(WorkOutcome::Pending(status));
        }
        Ok(WorkOutcome::Reply(apacket.create_reply_packet()))
    }
}
