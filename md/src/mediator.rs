//! The mediator main loop
//!
//! Each cycle waits for whichever side is expected to have news first,
//! pulls task updates from the local service and packets from the remote
//! service, runs the handlers, and sends any replies that are due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::MediatorResult;
use crate::handler::{HandlerRegistry, ServiceProviderAdapter};
use crate::packet::{Packet, TransactionId};
use crate::packet_manager::PacketManager;
use crate::provider::{HttpLocalService, LocalService, LocalServiceProxy};
use crate::remote::{AmieClient, RemoteService, RemoteServiceProxy};
use crate::retry::RetryingProxy;
use crate::snapshot::{DirSnapshots, SnapshotStore};
use crate::timing::{Clock, LoopDelay, SystemClock, WaitParms, ramp_wait};
use crate::transaction::{Disposition, TransactionManager};

/// Which service the next cycle waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSide {
    /// Long-poll the local service for task updates
    Local,
    /// Sleep, then list remote packets
    Remote,
}

pub struct Mediator {
    site_name: String,
    remote: Arc<RemoteServiceProxy>,
    clock: Arc<dyn Clock>,
    tm: TransactionManager,
    pm: PacketManager,
    local_wait: WaitParms,
    /// Timestamp of the newest task update seen
    task_cursor: Option<DateTime<Utc>>,
    /// Query time of the last packet listing
    packet_cursor: Option<DateTime<Utc>>,
    previous_wait: u64,
}

impl Mediator {
    pub fn new(
        site_name: impl Into<String>,
        remote: Arc<RemoteServiceProxy>,
        local: Arc<LocalServiceProxy>,
        amie_wait: WaitParms,
        local_wait: WaitParms,
        snapshots: Box<dyn SnapshotStore>,
    ) -> Self {
        let site_name = site_name.into();
        debug!(%site_name, "Mediator::new: called");
        let clock = Arc::clone(local.clock());
        let pm = PacketManager::new(HandlerRegistry::with_defaults(), ServiceProviderAdapter::new(local), snapshots);
        Self {
            site_name,
            remote,
            clock,
            tm: TransactionManager::new(amie_wait),
            pm,
            local_wait,
            task_cursor: None,
            packet_cursor: None,
            previous_wait: 0,
        }
    }

    /// Build a mediator talking to the configured HTTP services
    pub fn from_config(config: &Config) -> MediatorResult<Self> {
        debug!(site_name = %config.amie.site_name, "Mediator::from_config: called");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let remote: Arc<dyn RemoteService> = Arc::new(AmieClient::from_config(&config.amie)?);
        let remote = Arc::new(RetryingProxy::new(
            "amie",
            remote,
            config.amie.retry_config(),
            Arc::clone(&clock),
        ));

        let local: Arc<dyn LocalService> = Arc::new(HttpLocalService::from_config(&config.local)?);
        let local = Arc::new(RetryingProxy::new("local", local, config.local.retry_config(), clock));

        let snapshots = DirSnapshots::open(&config.snapshot_dir)?;
        Ok(Self::new(
            config.amie.site_name.clone(),
            remote,
            local,
            config.amie_wait_parms(),
            config.local_wait_parms(),
            Box::new(snapshots),
        ))
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.tm
    }

    fn local(&self) -> &Arc<LocalServiceProxy> {
        self.pm.adapter().local()
    }

    /// Fetch task updates, waiting up to `wait_secs` for one to appear
    ///
    /// Returns how many transactions changed.
    pub async fn load_tasks(&mut self, wait_secs: u64) -> MediatorResult<usize> {
        let since = self.task_cursor;
        let active = since.is_none();
        debug!(wait_secs, ?since, "Mediator::load_tasks: called");

        let tasks = self
            .local()
            .call(|svc| async move { svc.get_tasks(active, wait_secs, since).await })
            .await?;
        if let Some(newest) = tasks.iter().map(|t| t.timestamp).max() {
            self.task_cursor = Some(self.task_cursor.map_or(newest, |cursor| cursor.max(newest)));
        }

        let changed = self.tm.buffer_task_updates(tasks);
        debug!(changed = changed.len(), "Mediator::load_tasks: buffered");
        Ok(changed.len())
    }

    /// List packets updated since the last listing and buffer them
    ///
    /// Returns how many packets were accepted as new work.
    pub async fn load_packets(&mut self) -> MediatorResult<usize> {
        let querytime = self.clock.now();
        let since = self.packet_cursor;
        debug!(?since, "Mediator::load_packets: called");

        let packets = self
            .remote
            .call(|svc| async move { svc.list_packets(since).await })
            .await?;

        let mut accepted = 0;
        for packet in packets {
            if !packet.is_addressed_to(&self.site_name) {
                info!(target: "amiepackets", packet = %packet.label(), "ignored packet for another site");
                continue;
            }
            let label = packet.label();
            let id = packet.transaction_key();
            let disposition = self.tm.buffer_incoming_amie_packet(querytime, packet);
            info!(target: "amiepackets", packet = %label, disposition = %disposition.describe(), "received");
            match disposition {
                Disposition::Accepted => accepted += 1,
                Disposition::Completed => self.complete_transaction(&id).await?,
                _ => {}
            }
        }

        // tasks for transactions the remote side no longer lists
        for id in self.tm.purge_task_only_transactions() {
            debug!(%id, "Mediator::load_packets: dropping stale task-only transaction");
            self.pm.purge_transaction(&id);
        }
        self.tm.refresh_elapsed_timers(querytime);
        self.packet_cursor = Some(querytime);
        Ok(accepted)
    }

    /// The remote side closed a transaction
    async fn complete_transaction(&mut self, id: &TransactionId) -> MediatorResult<()> {
        debug!(%id, "Mediator::complete_transaction: called");
        let tid = id.clone();
        self.local()
            .call(|svc| async move { svc.clear_transaction(&tid).await })
            .await?;
        self.purge(id);
        Ok(())
    }

    fn purge(&mut self, id: &TransactionId) {
        self.pm.purge_transaction(id);
        self.tm.purge(id);
    }

    /// Run handlers on all actionable packets; returns the replies produced
    pub async fn service_packets(&mut self) -> MediatorResult<Vec<Packet>> {
        self.pm.service_actionable_packets(&mut self.tm).await
    }

    /// Send every buffered reply that is due
    ///
    /// A sent ITC ends its transaction. Other replies are held until the
    /// remote service acknowledges or answers them.
    pub async fn flush_replies(&mut self) -> MediatorResult<usize> {
        let now = self.clock.now();
        let outgoing = self.tm.get_outgoing_amie_packets(now);
        debug!(count = outgoing.len(), "Mediator::flush_replies: called");

        let mut sent = 0;
        for packet in outgoing {
            let to_send = packet.clone();
            self.remote
                .call(|svc| async move { svc.send_packet(&to_send).await })
                .await?;
            info!(target: "amiepackets", packet = %packet.label(), "sent");
            sent += 1;
            if !packet.expects_reply() {
                self.purge(&packet.transaction_key());
            }
        }
        Ok(sent)
    }

    /// One pass without waiting: tasks, packets, handlers, replies
    pub async fn run_once(&mut self) -> MediatorResult<()> {
        debug!("Mediator::run_once: called");
        self.load_tasks(0).await?;
        self.load_packets().await?;
        self.service_packets().await?;
        self.flush_replies().await?;
        Ok(())
    }

    /// When the next packet listing is due
    fn remote_target(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.packet_cursor {
            None => now,
            Some(last) => self.tm.get_loop_delay(last).target_time().unwrap_or(now),
        }
    }

    /// When local task updates are next expected
    fn local_target(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let class = self.pm.expected_task_updates(&self.tm).delay_class();
        LoopDelay::new(self.local_wait).calculate_target_time(now, class)
    }

    /// Decide which side to wait on and for how many seconds
    ///
    /// The wait ramps up from a few seconds so that a burst of activity is
    /// followed closely.
    pub fn next_wait(&mut self) -> (WaitSide, u64) {
        let now = self.clock.now();
        let remote_target = self.remote_target(now);
        let local_target = self.local_target(now);
        let raw = (remote_target - now).num_seconds().max(0) as u64;
        let wait = if raw == 0 { 0 } else { ramp_wait(self.previous_wait, raw) };
        self.previous_wait = wait;

        let side = if local_target <= remote_target {
            WaitSide::Local
        } else {
            WaitSide::Remote
        };
        debug!(?side, wait, raw, "Mediator::next_wait: decided");
        (side, wait)
    }

    /// One cycle of the main loop
    pub async fn run_cycle(&mut self) -> MediatorResult<()> {
        let (side, wait) = self.next_wait();
        match side {
            WaitSide::Local => {
                self.load_tasks(wait).await?;
            }
            WaitSide::Remote => {
                if wait > 0 {
                    self.clock.sleep(Duration::from_secs(wait)).await;
                }
                self.load_tasks(0).await?;
            }
        }

        let now = self.clock.now();
        if now >= self.remote_target(now) {
            self.load_packets().await?;
        }
        self.service_packets().await?;
        self.flush_replies().await?;
        Ok(())
    }

    /// Cycle until an error escapes
    pub async fn run_loop(&mut self) -> MediatorResult<()> {
        info!(site_name = %self.site_name, "Mediator::run_loop: starting");
        loop {
            self.run_cycle().await?;
        }
    }

    /// Cycle forever, restarting after transient service errors
    ///
    /// Returns only on an error that retrying cannot fix.
    pub async fn run_loop_persistently(&mut self) -> MediatorResult<()> {
        loop {
            match self.run_loop().await {
                Err(err) if err.is_restartable() => {
                    warn!(error = %err, "Mediator::run_loop_persistently: restarting after service error");
                }
                other => return other,
            }
        }
    }
}
