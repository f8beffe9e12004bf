//! Transaction state and the registry of live transactions
//!
//! A `Transaction` holds the single current packet of one AMIE transaction.
//! While the packet is incoming it is wrapped in an `ActionablePacket` that a
//! handler works on; once a reply is buffered the transaction is outgoing and
//! its `LoopDelay` says when the reply may be (re)sent. Tasks that arrive
//! before their packet are parked by packet id until the packet shows up.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::apacket::ActionablePacket;
use crate::error::ValidationError;
use crate::packet::{Packet, TransactionId};
use crate::task::{TaskStatus, TaskStatusList};
use crate::timing::{DelayClass, LoopDelay, WaitParms};

/// Which way the current packet flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// What the manager did with a packet from the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// New packet; an ActionablePacket was created for it
    Accepted,
    /// Already held; nothing changed
    Duplicate,
    /// The remote service's copy of the reply we sent
    Acknowledged,
    /// Invalid packet; a failure reply is buffered
    Rejected(String),
    /// Inbound ITC; the transaction is over
    Completed,
}

impl Disposition {
    pub fn describe(&self) -> String {
        match self {
            Disposition::Accepted => "Accepted/buffered incoming packet".to_string(),
            Disposition::Duplicate => "Ignoring duplicate packet".to_string(),
            Disposition::Acknowledged => "Remote service received our reply".to_string(),
            Disposition::Rejected(msg) => format!("Rejected invalid packet: {}", msg),
            Disposition::Completed => "Got ITC packet - purging transaction".to_string(),
        }
    }
}

/// State of one AMIE transaction
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    packet: Option<Packet>,
    direction: Direction,
    acknowledged: bool,
    apacket: Option<ActionablePacket>,
    dangling_tasks: HashMap<String, TaskStatusList>,
    loop_delay: LoopDelay,
}

impl Transaction {
    pub fn new(id: TransactionId, wait_parms: WaitParms) -> Self {
        debug!(%id, "Transaction::new: called");
        Self {
            id,
            packet: None,
            direction: Direction::Incoming,
            acknowledged: false,
            apacket: None,
            dangling_tasks: HashMap::new(),
            loop_delay: LoopDelay::new(wait_parms),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True once a reply is buffered for this transaction
    pub fn is_outgoing(&self) -> bool {
        self.packet.is_some() && self.direction == Direction::Outgoing
    }

    pub fn actionable_packet(&self) -> Option<&ActionablePacket> {
        self.apacket.as_ref()
    }

    pub fn actionable_packet_mut(&mut self) -> Option<&mut ActionablePacket> {
        self.apacket.as_mut()
    }

    pub fn loop_delay(&self) -> &LoopDelay {
        &self.loop_delay
    }

    /// Tasks for the given packet id, wherever they are currently held
    pub fn tasks(&self, packet_id: &str) -> Option<&TaskStatusList> {
        match &self.apacket {
            Some(apacket) if apacket.packet_id() == packet_id => Some(apacket.tasks()),
            _ => self.dangling_tasks.get(packet_id),
        }
    }

    /// Every task known to this transaction
    pub fn all_tasks(&self) -> impl Iterator<Item = &TaskStatus> {
        self.apacket
            .iter()
            .flat_map(|ap| ap.tasks().iter())
            .chain(self.dangling_tasks.values().flat_map(|list| list.iter()))
    }

    /// Add or update a task; returns true if the ActionablePacket changed
    pub fn buffer_task(&mut self, status: TaskStatus) -> bool {
        debug!(transaction = %self.id, task_name = %status.task_name, "Transaction::buffer_task: called");
        match self.apacket.as_mut() {
            Some(apacket) if apacket.packet_id() == status.keys.packet_id => apacket.add_or_update_task(status),
            _ => {
                self.dangling_tasks
                    .entry(status.keys.packet_id.clone())
                    .or_default()
                    .put(status);
                false
            }
        }
    }

    /// Retire the ActionablePacket, keeping its tasks under its packet id
    ///
    /// Tasks outlive the packet they were run for and stay until the
    /// transaction is purged.
    fn park_apacket_tasks(&mut self) {
        if let Some(apacket) = self.apacket.take() {
            if apacket.tasks().is_empty() {
                return;
            }
            debug!(transaction = %self.id, packet_id = %apacket.packet_id(), "Transaction::park_apacket_tasks: keeping tasks");
            self.dangling_tasks
                .entry(apacket.packet_id().to_string())
                .or_default()
                .put_all(apacket.tasks().iter().cloned());
        }
    }

    /// Take in a packet listed by the remote service
    ///
    /// A packet with a new identity is validated and replaces whatever the
    /// transaction held, carrying over tasks already kept under its packet
    /// id. A packet we already hold only refreshes an elapsed timer.
    pub fn buffer_incoming_amie_packet(
        &mut self,
        querytime: DateTime<Utc>,
        packet: Packet,
    ) -> Result<Disposition, ValidationError> {
        debug!(transaction = %self.id, packet = %packet.label(), "Transaction::buffer_incoming_amie_packet: called");

        if let Some(held) = &self.packet {
            if self.direction == Direction::Outgoing && packet.is_echo_of(held) {
                if !self.acknowledged {
                    self.acknowledged = true;
                    self.loop_delay
                        .calculate_target_time(querytime, DelayClass::HumanActionPending);
                }
                return Ok(Disposition::Acknowledged);
            }
            if held.same_identity(&packet) {
                if self.loop_delay.target_time().is_none_or(|t| t < querytime) {
                    self.loop_delay
                        .calculate_target_time(querytime, DelayClass::HumanActionPending);
                }
                return Ok(Disposition::Duplicate);
            }
        }

        packet.validate()?;
        self.park_apacket_tasks();
        let tasks = self.dangling_tasks.remove(&packet.packet_id());
        let apacket = ActionablePacket::new(packet.clone(), tasks)?;
        self.packet = Some(packet);
        self.apacket = Some(apacket);
        self.direction = Direction::Incoming;
        self.acknowledged = false;
        self.loop_delay
            .calculate_target_time(querytime, DelayClass::HumanActionPending);
        Ok(Disposition::Accepted)
    }

    /// Hold a reply for sending; returns false if it is already held
    pub fn buffer_outgoing_amie_packet(&mut self, now: DateTime<Utc>, packet: Packet) -> bool {
        debug!(transaction = %self.id, packet = %packet.label(), "Transaction::buffer_outgoing_amie_packet: called");
        if self.is_outgoing() && self.packet.as_ref().is_some_and(|held| held.same_identity(&packet)) {
            return false;
        }
        self.park_apacket_tasks();
        self.packet = Some(packet);
        self.direction = Direction::Outgoing;
        self.acknowledged = false;
        // send straight away; later resends wait for the timer
        self.loop_delay.set_immediate(now);
        true
    }

    /// The buffered reply, if it is due to be (re)sent
    pub fn get_outgoing_amie_packet(&mut self, now: DateTime<Utc>) -> Option<Packet> {
        if !self.is_outgoing() || self.acknowledged || !self.loop_delay.is_due(now) {
            return None;
        }
        self.loop_delay.calculate_target_time(now, DelayClass::ImminentAutoReply);
        self.packet.clone()
    }

    /// Push an elapsed timer forward after the remote service was polled
    ///
    /// Unacknowledged replies keep their resend time.
    pub fn refresh_elapsed_timer(&mut self, querytime: DateTime<Utc>) {
        if self.packet.is_none() || (self.is_outgoing() && !self.acknowledged) {
            return;
        }
        if self.loop_delay.target_time().is_some_and(|t| t <= querytime) {
            self.loop_delay
                .calculate_target_time(querytime, DelayClass::HumanActionPending);
        }
    }
}

/// Registry of live transactions keyed by transaction id
#[derive(Debug)]
pub struct TransactionManager {
    wait_parms: WaitParms,
    transactions: BTreeMap<TransactionId, Transaction>,
}

impl TransactionManager {
    pub fn new(wait_parms: WaitParms) -> Self {
        Self {
            wait_parms,
            transactions: BTreeMap::new(),
        }
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.keys().cloned().collect()
    }

    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn transaction_mut(&mut self, id: &TransactionId) -> &mut Transaction {
        let wait_parms = self.wait_parms;
        self.transactions
            .entry(id.clone())
            .or_insert_with(|| Transaction::new(id.clone(), wait_parms))
    }

    /// Route a task to its transaction, creating the transaction if needed
    pub fn add_or_update_task(&mut self, status: TaskStatus) -> bool {
        let id = status.keys.transaction_id.clone();
        self.transaction_mut(&id).buffer_task(status)
    }

    /// Buffer task updates; returns transactions whose ActionablePacket changed
    pub fn buffer_task_updates<I: IntoIterator<Item = TaskStatus>>(&mut self, tasks: I) -> BTreeSet<TransactionId> {
        let mut changed = BTreeSet::new();
        for task in tasks {
            let id = task.keys.transaction_id.clone();
            if self.add_or_update_task(task) {
                changed.insert(id);
            }
        }
        debug!(changed = changed.len(), "TransactionManager::buffer_task_updates: done");
        changed
    }

    /// Take in a packet addressed to this site
    pub fn buffer_incoming_amie_packet(&mut self, querytime: DateTime<Utc>, packet: Packet) -> Disposition {
        let id = packet.transaction_key();
        if packet.packet_type.is_itc() {
            debug!(%id, "TransactionManager::buffer_incoming_amie_packet: transaction complete");
            return Disposition::Completed;
        }

        let transaction = self.transaction_mut(&id);
        match transaction.buffer_incoming_amie_packet(querytime, packet.clone()) {
            Ok(disposition) => disposition,
            Err(err) => {
                let message = err.to_string();
                warn!(%id, %message, "TransactionManager::buffer_incoming_amie_packet: invalid packet");
                transaction.buffer_outgoing_amie_packet(querytime, packet.reply_with_failure(&message));
                Disposition::Rejected(message)
            }
        }
    }

    pub fn have_actionable_packets(&self) -> bool {
        self.transactions.values().any(|t| t.apacket.is_some())
    }

    pub fn actionable_packet_count(&self) -> usize {
        self.transactions.values().filter(|t| t.apacket.is_some()).count()
    }

    /// ActionablePackets, oldest packet first
    pub fn actionable_packets(&self) -> Vec<&ActionablePacket> {
        let mut apackets: Vec<&ActionablePacket> = self
            .transactions
            .values()
            .filter_map(Transaction::actionable_packet)
            .collect();
        apackets.sort_by(|a, b| {
            a.packet_timestamp()
                .cmp(&b.packet_timestamp())
                .then_with(|| a.transaction_id().cmp(b.transaction_id()))
        });
        apackets
    }

    pub fn actionable_packet(&self, id: &TransactionId) -> Option<&ActionablePacket> {
        self.transactions.get(id).and_then(Transaction::actionable_packet)
    }

    pub fn actionable_packet_mut(&mut self, id: &TransactionId) -> Option<&mut ActionablePacket> {
        self.transactions.get_mut(id).and_then(Transaction::actionable_packet_mut)
    }

    pub fn buffer_outgoing_amie_packet(&mut self, now: DateTime<Utc>, packet: Packet) -> bool {
        let id = packet.transaction_key();
        self.transaction_mut(&id).buffer_outgoing_amie_packet(now, packet)
    }

    /// Buffered replies whose (re)send time has come
    pub fn get_outgoing_amie_packets(&mut self, now: DateTime<Utc>) -> Vec<Packet> {
        self.transactions
            .values_mut()
            .filter_map(|t| t.get_outgoing_amie_packet(now))
            .collect()
    }

    pub fn refresh_elapsed_timers(&mut self, querytime: DateTime<Utc>) {
        for transaction in self.transactions.values_mut() {
            transaction.refresh_elapsed_timer(querytime);
        }
    }

    /// Drop all state for a transaction
    pub fn purge(&mut self, id: &TransactionId) -> bool {
        let removed = self.transactions.remove(id).is_some();
        if removed {
            info!(%id, "TransactionManager::purge: purged transaction");
        }
        removed
    }

    /// Purge transactions known only from tasks, with no packet seen
    pub fn purge_task_only_transactions(&mut self) -> Vec<TransactionId> {
        let obsolete: Vec<TransactionId> = self
            .transactions
            .values()
            .filter(|t| t.packet.is_none())
            .map(|t| t.id.clone())
            .collect();
        for id in &obsolete {
            self.purge(id);
        }
        obsolete
    }

    /// Every task held by any transaction
    pub fn all_tasks(&self) -> impl Iterator<Item = &TaskStatus> {
        self.transactions.values().flat_map(Transaction::all_tasks)
    }

    /// LoopDelay whose target is the earliest transaction target
    ///
    /// With no transaction timers the target is `now` plus the idle delay.
    pub fn get_loop_delay(&self, now: DateTime<Utc>) -> LoopDelay {
        let mut loop_delay = LoopDelay::new(self.wait_parms);
        let idle = loop_delay.calculate_target_time(now, DelayClass::Idle);
        let earliest = self
            .transactions
            .values()
            .filter_map(|t| t.loop_delay.target_time())
            .fold(idle, |earliest, t| earliest.min(t));
        loop_delay.set_target_time(earliest);
        loop_delay
    }
}
