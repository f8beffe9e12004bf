//! Poll timing primitives
//!
//! `LoopDelay` tracks when a side (remote or local) should next be polled,
//! using one of three delay classes from its `WaitParms`. The `Clock` trait
//! lets the loop and the retry proxy run against simulated time in tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Source of the current time and of cooperative sleeps
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        debug!(secs = duration.as_secs(), "SystemClock::sleep: called");
        tokio::time::sleep(duration).await;
    }
}

/// `base + duration`, saturating
pub fn add_duration(base: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
    base.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What the poller is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayClass {
    /// An automatic response should arrive shortly
    ImminentAutoReply,
    /// Progress depends on a person acting
    HumanActionPending,
    /// Nothing is expected
    Idle,
}

/// Delay per class for one side of the mediator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitParms {
    pub auto_reply_delay: Duration,
    pub human_action_delay: Duration,
    pub idle_delay: Duration,
}

impl WaitParms {
    pub fn new(auto_reply_delay: Duration, human_action_delay: Duration, idle_delay: Duration) -> Self {
        Self {
            auto_reply_delay,
            human_action_delay,
            idle_delay,
        }
    }

    pub fn delay(&self, class: DelayClass) -> Duration {
        match class {
            DelayClass::ImminentAutoReply => self.auto_reply_delay,
            DelayClass::HumanActionPending => self.human_action_delay,
            DelayClass::Idle => self.idle_delay,
        }
    }
}

/// Base and target time for the next poll
#[derive(Debug, Clone, PartialEq)]
pub struct LoopDelay {
    parms: WaitParms,
    base_time: Option<DateTime<Utc>>,
    target_time: Option<DateTime<Utc>>,
}

impl LoopDelay {
    pub fn new(parms: WaitParms) -> Self {
        Self {
            parms,
            base_time: None,
            target_time: None,
        }
    }

    pub fn parms(&self) -> &WaitParms {
        &self.parms
    }

    /// Set `target = base + delay[class]` and return it
    pub fn calculate_target_time(&mut self, base_time: DateTime<Utc>, class: DelayClass) -> DateTime<Utc> {
        let target = add_duration(base_time, self.parms.delay(class));
        debug!(%base_time, ?class, %target, "LoopDelay::calculate_target_time: called");
        self.base_time = Some(base_time);
        self.target_time = Some(target);
        target
    }

    /// Make the target due at `base_time`
    pub fn set_immediate(&mut self, base_time: DateTime<Utc>) {
        self.base_time = Some(base_time);
        self.target_time = Some(base_time);
    }

    pub fn base_time(&self) -> Option<DateTime<Utc>> {
        self.base_time
    }

    pub fn target_time(&self) -> Option<DateTime<Utc>> {
        self.target_time
    }

    pub fn set_target_time(&mut self, target_time: DateTime<Utc>) {
        self.target_time = Some(target_time);
    }

    /// True when no target is set or the target has been reached
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.target_time.is_none_or(|t| now >= t)
    }

    /// Whole seconds until the target, never negative
    pub fn wait_secs(&self, now: DateTime<Utc>) -> u64 {
        match self.target_time {
            Some(target) if target > now => (target - now).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// Limit growth of the wait between cycles
///
/// A wait longer than the previous one is clamped to `max(previous * 2, 4)`.
pub fn ramp_wait(previous: u64, new: u64) -> u64 {
    if new > previous {
        new.min(previous.saturating_mul(2).max(4))
    } else {
        new
    }
}
