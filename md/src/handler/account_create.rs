use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::steps;
use super::{PacketHandler, ServiceProviderAdapter, WorkOutcome, copy_fields};
use crate::apacket::ActionablePacket;
use crate::error::ServiceError;
use crate::packet::PacketType;
use crate::request::Role;

/// `request_account_create`: set up the user and give them an account on the project
pub struct RequestAccountCreate;

#[async_trait]
impl PacketHandler for RequestAccountCreate {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestAccountCreate
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "RequestAccountCreate::work: called");

        if let Some(status) = steps::define_org_code(adapter, apacket, Role::User).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        if let Some(status) = steps::define_person(adapter, apacket, Role::User).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        if let Some(status) = steps::activate_person(adapter, apacket, Role::User).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        if let Some(status) = steps::define_account(adapter, apacket).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        if let Some(status) = steps::notify_user(adapter, apacket).await? {
            return Ok(WorkOutcome::Pending(status));
        }

        let mut reply = apacket.create_reply_packet();
        copy_fields(
            &mut reply,
            apacket,
            &[
                "UserFirstName",
                "UserLastName",
                "UserOrganization",
                "UserOrgCode",
                "AcademicDegree",
                "ResourceList",
            ],
        );
        let r = &apacket.resolved;
        if let Some(time) = &r.account_activity_time {
            reply.set("AccountActivityTime", time.as_str());
        }
        let project_id = r.project_id.clone().or_else(|| apacket.field_string("ProjectID"));
        if let Some(project_id) = project_id {
            reply.set("ProjectID", project_id);
        }
        if let Some(person_id) = &r.person_id {
            reply.set("UserPersonID", person_id.as_str());
        }
        let login = r.account_login.clone().unwrap_or_default();
        reply.set("UserRemoteSiteLogin", Value::String(login));
        Ok(WorkOutcome::Reply(reply))
    }
}
