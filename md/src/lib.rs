//! amiemediator - AMIE transaction mediator
//!
//! Sits between a remote AMIE service, which exchanges account and allocation
//! packets with a site, and a local service that does the site's provisioning
//! work. Each incoming request packet is worked through a handler that asks the
//! local service for one task at a time; once every task has succeeded the
//! handler builds the reply packet, which is sent and resent until the remote
//! side acknowledges it.
//!
//! # Core Concepts
//!
//! - **Rebuildable state**: transactions live in memory only and are rebuilt
//!   from both services after a restart
//! - **Resumable handlers**: handlers are re-run every cycle and skip steps whose
//!   results are already recorded on the packet
//! - **One proxy per service**: every call goes through a `RetryingProxy` that
//!   absorbs transient failures with exponential backoff
//!
//! # Modules
//!
//! - [`transaction`] - Transaction state and reply timers
//! - [`handler`] - Per-packet-type handlers and the steps they share
//! - [`packet_manager`] - Drives handlers and writes monitoring snapshots
//! - [`mediator`] - The main polling loop
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod apacket;
pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod mediator;
pub mod packet;
pub mod packet_manager;
pub mod provider;
pub mod remote;
pub mod request;
pub mod retry;
pub mod snapshot;
pub mod task;
pub mod timing;
pub mod transaction;

// Re-export commonly used types
pub use apacket::{ActionablePacket, ResolvedSteps};
pub use config::{AmieConfig, Config, LocalConfig};
pub use error::{MediatorError, MediatorResult, ServiceError, ValidationError};
pub use handler::{HandlerRegistry, PacketHandler, ServiceProviderAdapter, WorkOutcome};
pub use mediator::{Mediator, WaitSide};
pub use packet::{Packet, PacketHeader, PacketType, TransactionId};
pub use packet_manager::{PacketManager, TaskExpectation};
pub use provider::{HttpLocalService, LocalService, LocalServiceProxy};
pub use remote::{AmieClient, RemoteService, RemoteServiceProxy};
pub use request::{LookupKind, LookupRequest, Operation, Role, TaskRequest};
pub use retry::{RetryConfig, RetryingProxy};
pub use snapshot::{DirSnapshots, SnapshotStore};
pub use task::{Product, TaskKeys, TaskState, TaskStatus, TaskStatusList};
pub use timing::{Clock, DelayClass, LoopDelay, SystemClock, WaitParms};
pub use transaction::{Disposition, Transaction, TransactionManager};
