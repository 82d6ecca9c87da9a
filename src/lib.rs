//! BrandenBed case lifecycle engine
//!
//! Leads, support tickets, residency contracts, maintenance requests and
//! housekeeping visits share one lifecycle model: a per-type status machine,
//! set-once timestamps, derived deadlines and an append-only activity log.
//!
//! ## Call chain
//! Caller -> CaseRepository -> status_machine::apply -> CaseStore::commit
//! (record + activity entry in one unit)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use brandenbed_cases::{
//!     Actor, CaseRepository, CaseStatus, EngineConfig, InMemoryDirectory, MemoryStore,
//!     NewCase, StatusUpdate, SystemClock, TicketStatus,
//! };
//!
//! # async fn demo() -> brandenbed_cases::Result<()> {
//! let repo = CaseRepository::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SystemClock),
//!     Arc::new(InMemoryDirectory::new()),
//!     EngineConfig::default(),
//! );
//! let ticket = repo.create(NewCase::ticket("amenities", "No WiFi"), Actor::System).await?;
//! repo.update_status(
//!     &ticket.reference,
//!     StatusUpdate::to(CaseStatus::Ticket(TicketStatus::InProgress)),
//!     Actor::System,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Time source
pub mod clock;

// Case types, statuses and identifiers
pub mod identifier;
pub mod types;

// Lifecycle rules
pub mod obligations;
pub mod record;
pub mod status_machine;

// Activity log and queries
pub mod activity;
pub mod filter;

// External collaborators and configuration
pub mod config;
pub mod staff;

// Persistence
pub mod repository;
pub mod store;

pub use activity::{ActivityEntry, ActivityKind, NewActivity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CategoryConfig, EngineConfig};
pub use error::{CaseError, Result};
pub use filter::{Assignee, CaseFilter, Page};
pub use identifier::{CaseReference, SequenceKey};
pub use obligations::Obligations;
pub use record::{CaseRecord, NewCase};
pub use repository::{CaseRepository, StatusUpdate};
pub use staff::{InMemoryDirectory, StaffDirectory, StaffMember, StaffRole};
pub use status_machine::{Lifecycle, Resolution, Stamp, Transition};
#[cfg(feature = "database")]
pub use store::PgCaseStore;
pub use store::{CaseStore, MemoryStore, Reassignment};
pub use types::{
    Actor, CaseStatus, CaseType, ContractStatus, HousekeepingStatus, LeadStatus,
    MaintenanceStatus, Priority, StaffId, TicketStatus,
};
