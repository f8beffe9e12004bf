use async_trait::async_trait;
use serde_json::Map;
use tracing::debug;

use super::steps;
use super::{PacketHandler, ServiceProviderAdapter, WorkOutcome, copy_fields};
use crate::apacket::ActionablePacket;
use crate::error::ServiceError;
use crate::packet::PacketType;
use crate::request::Operation;

const REPLY_FIELDS: &[&str] = &["ProjectID", "ResourceList"];

/// `request_project_inactivate`: the local service inactivates the project and its accounts
pub struct RequestProjectInactivate;

#[async_trait]
impl PacketHandler for RequestProjectInactivate {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestProjectInactivate
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "RequestProjectInactivate::work: called");

        let pending = steps::run_flagged(adapter, apacket, Operation::InactivateProject, None, Map::new(), |r| {
            &mut r.project_inactivated
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

pub struct RequestProjectReactivate;

#[async_trait]
impl PacketHandler for RequestProjectReactivate {
    fn packet_type(&self) -> PacketType {
        PacketType::RequestProjectReactivate
    }

    async fn work(
        &self,
        apacket: &mut ActionablePacket,
        adapter: &ServiceProviderAdapter,
    ) -> Result<WorkOutcome, ServiceError> {
        debug!(apacket = %apacket.name(), "RequestProjectReactivate::work: called");

        let pending = steps::run_flagged(adapter, apacket, Operation::ReactivateProject, None, Map::new(), |r| {
            &mut r.project_reactivated
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::adapter;
    use crate::packet::Packet;
    use crate::packet::fixtures::header;
    use crate::provider::mock::ScriptedLocalService;
    use crate::task::{Product, TaskState};
    use serde_json::json;
    use std::sync::Arc;

    fn packet(packet_type: PacketType) -> Packet {
        let mut packet = Packet::new(packet_type, header(400, 1, 60));
        packet.set("ProjectID", "p-abc123");
        packet.set("ResourceList", json!(["cluster.site.org"]));
        packet
    }

    #[tokio::test]
    async fn test_inactivate_project() {
        let local = Arc::new(ScriptedLocalService::new());
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(packet(PacketType::RequestProjectInactivate), None).unwrap();

        let reply = match RequestProjectInactivate.work(&mut ap, &adapter).await.unwrap() {
            WorkOutcome::Reply(reply) => reply,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(reply.packet_type, PacketType::NotifyProjectInactivate);
        assert_eq!(reply.get("ProjectID"), Some(&json!("p-abc123")));
        assert_eq!(reply.get("ResourceList"), Some(&json!(["cluster.site.org"])));
    }

    #[tokio::test]
    async fn test_reactivate_failure_is_request_failed() {
        let local = Arc::new(ScriptedLocalService::new());
        local.script(
            Operation::ReactivateProject,
            TaskState::Failed,
            vec![Product::new("FAILED", "unknown project")],
        );
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(packet(PacketType::RequestProjectReactivate), None).unwrap();

        let err = RequestProjectReactivate.work(&mut ap, &adapter).await.unwrap_err();
        assert!(matches!(err, ServiceError::RequestFailed(_)));
        assert_eq!(ap.resolved.project_reactivated, None);
    }
}
