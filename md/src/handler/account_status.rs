use async_trait::async_trait;
use serde_json::Map;
use tracing::debug;

use super::steps;
use super::{PacketHandler, ServiceProviderAdapter, WorkOutcome, copy_fields};
use crate::apacket::ActionablePacket;
use crate::error::ServiceError;
use crate::packet::PacketType;
use crate::request::{Operation, Role};

const REPLY_FIELDS: &[&str] = &["PersonID", "ProjectID", "ResourceList"];

pub struct RequestAccountInactivate;

#[async_trait]
impl PacketHandler for RequestAccountInactivate {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestAccountInactivate
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "RequestAccountInactivate::work: called");

        let pending = steps::run_flagged(adapter, apacket, Operation::InactivateAccount, None, Map::new(), |r| {
            &mut r.account_inactivated
        })
        .await?;
        if let Some(status) = pending {
            return Ok(WorkOutcome::Pending(status));
        }

        let mut reply = apacket.create_reply_packet();
        copy_fields(&mut reply, apacket, REPLY_FIELDS);
        Ok(WorkOutcome::Reply(reply))
    }
}

/// `request_account_reactivate`: reactivate the person, tell them, then restore the account
pub struct RequestAccountReactivate;

#[async_trait]
impl PacketHandler for RequestAccountReactivate {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestAccountReactivate
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "RequestAccountReactivate::work: called");

        if apacket.resolved.person_id.is_none() {
            apacket.resolved.person_id = apacket.field_string("PersonID");
        }
        if apacket.resolved.project_id.is_none() {
            apacket.resolved.project_id = apacket.field_string("ProjectID");
        }

        if let Some(status) = steps::activate_person(adapter, apacket, Role::User).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        if let Some(status) = steps::notify_user(adapter, apacket).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        let pending = steps::run_flagged(adapter, apacket, Operation::ReactivateAccount, None, Map::new(), |r| {
            &mut r.account_reactivated
        })
        .await?;
        if let Some(status) = pending {
            return Ok(WorkOutcome::Pending(status));
        }

        let mut reply = apacket.create_reply_packet();
        copy_fields(&mut reply, apacket, REPLY_FIELDS);
        Ok(WorkOutcome::Reply(reply))
    }
}
