//! # Cadence Core Library
//!
//! A recurring event engine: given an event template and a recurrence rule,
//! it materializes concrete, queryable instances for a rolling per-organization
//! hot window, keeps that window advancing and pruning unattended, and supports
//! occurrence-scoped, this-and-future, and entire-series edits without
//! corrupting already-issued instances.
//!
//! ## Features
//!
//! - **Windowed Materialization**: instances are pre-calculated for a rolling
//!   hot window and pruned past a retention horizon, per organization
//! - **Idempotent Runs**: every write is keyed so re-running a window is a
//!   no-op, making retry-after-partial-failure safe without distributed
//!   transactions
//! - **Series Splits**: "this and future" edits branch a series into a new
//!   template + rule sharing a lineage id; history stays where it was issued
//! - **Occurrence References**: dependent records bind to a whole series or
//!   to one concrete occurrence, resolved at read time
//! - **Type Safety**: sqlx-backed persistence with typed entities throughout
//!
//! ## Core Modules
//!
//! - [`db`]: Database connection and migration management
//! - [`models`]: Core data structures and transfer objects
//! - [`repository`]: Data access layer with Repository pattern
//! - [`expander`]: Pure recurrence expansion into sequenced occurrences
//! - [`worker`]: Per-organization materialization driver
//! - [`error`]: Engine error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cadence_core::{
//!     db,
//!     models::{Frequency, NewSeriesData, RecurrenceInput},
//!     repository::{SeriesRepository, SqliteRepository},
//!     worker::MaterializationWorker,
//! };
//! use chrono::{Duration, Utc};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = db::establish_connection("cadence.db").await?;
//!     let repo = Arc::new(SqliteRepository::new(pool));
//!
//!     let starts_at = Utc::now() + Duration::days(1);
//!     let (template, rule) = repo
//!         .create_series(NewSeriesData {
//!             organization_id: Uuid::now_v7(),
//!             name: "Weekly standup".to_string(),
//!             description: None,
//!             location: None,
//!             starts_at,
//!             ends_at: starts_at + Duration::minutes(30),
//!             all_day: false,
//!             recurrence: RecurrenceInput::new(Frequency::Weekly),
//!             creator_id: Uuid::now_v7(),
//!         })
//!         .await?;
//!     println!("Created series {} under rule {}", template.id, rule.id);
//!
//!     let worker = MaterializationWorker::new(repo);
//!     worker.run_all(Utc::now()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod error;
pub mod expander;
pub mod models;
pub mod repository;
pub mod worker;
