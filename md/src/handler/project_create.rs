use async_trait::async_trait;
use tracing::debug;

use super::steps::{self, value_to_f64};
use super::{PacketHandler, ServiceProviderAdapter, WorkOutcome, copy_fields};
use crate::apacket::ActionablePacket;
use crate::error::{ServiceError, ValidationError};
use crate::packet::{Packet, PacketType};
use crate::request::Role;

/// `request_project_create`: a new project, or a renewal/supplement of an existing one
///
/// A request with a `RecordID` the local service already provisioned is
/// answered straight away. Otherwise new projects go through grant, name-base
/// and project creation, and any other allocation type updates the
/// allocation of the project named in the packet.
pub struct RequestProjectCreate;

#[async_trait]
impl PacketHandler for RequestProjectCreate {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestProjectCreate
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        let allocation_type = apacket.field_string("AllocationType").unwrap_or_default();
        debug!(apacket = %apacket.name(), %allocation_type, "RequestProjectCreate::work: called");

        if steps::lookup_project_task(adapter, apacket).await? {
            debug!(apacket = %apacket.name(), "RequestProjectCreate::work: project already provisioned");
            return Ok(WorkOutcome::Reply(build_reply(apacket)));
        }

        if let Some(status) = steps::define_org_code(adapter, apacket, Role::Pi).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        if let Some(status) = steps::define_person(adapter, apacket, Role::Pi).await? {
            return Ok(WorkOutcome::Pending(status));
        }
        if let Some(status) = steps::activate_person(adapter, apacket, Role::Pi).await? {
            return Ok(WorkOutcome::Pending(status));
        }

        if matches!(allocation_type.as_str(), "new" | "renewal") {
            if let Some(status) = steps::define_local_fos(adapter, apacket).await? {
                return Ok(WorkOutcome::Pending(status));
            }
        }

        if allocation_type == "new" {
            if let Some(status) = steps::define_site_grant_key(adapter, apacket).await? {
                return Ok(WorkOutcome::Pending(status));
            }
            if let Some(status) = steps::define_project_name_base(adapter, apacket).await? {
                return Ok(WorkOutcome::Pending(status));
            }
            if let Some(status) = steps::define_project(adapter, apacket).await? {
                return Ok(WorkOutcome::Pending(status));
            }
        } else {
            if apacket.resolved.project_id.is_none() {
                let project_id = apacket
                    .field_string("ProjectID")
                    .ok_or_else(|| ValidationError::MissingFields(vec!["ProjectID".to_string()]))?;
                apacket.resolved.project_id = Some(project_id);
            }
            if let Some(status) = steps::define_allocation(adapter, apacket).await? {
                return Ok(WorkOutcome::Pending(status));
            }
        }

        if let Some(status) = steps::notify_user(adapter, apacket).await? {
            return Ok(WorkOutcome::Pending(status));
        }

        Ok(WorkOutcome::Reply(build_reply(apacket)))
    }
}

fn build_reply(apacket: &ActionablePacket) -> Packet {
    let mut reply = apacket.create_reply_packet();
    copy_fields(
        &mut reply,
        apacket,
        &["GrantNumber", "PfosNumber", "PiOrgCode", "ProjectTitle", "ResourceList"],
    );
    let r = &apacket.resolved;
    if let Some(person_id) = &r.person_id {
        reply.set("PiPersonID", person_id.as_str());
    }
    if let Some(login) = r.remote_site_login.as_ref().or(r.person_id.as_ref()) {
        reply.set("PiRemoteSiteLogin", login.as_str());
    }
    if let Some(project_id) = &r.project_id {
        reply.set("ProjectID", project_id.as_str());
    }
    let units = r
        .service_units_allocated
        .or_else(|| apacket.field("ServiceUnitsAllocated").and_then(value_to_f64));
    if let Some(units) = units {
        reply.set("ServiceUnitsAllocated", units);
    }
    for (resolved, field) in [(&r.start_date, "StartDate"), (&r.end_date, "EndDate")] {
        if let Some(date) = resolved.clone().or_else(|| apacket.field_string(field)) {
            reply.set(field, date);
        }
    }
    reply
}
