// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Veriflow Core - Shared model, state store and event bus gateway
//!
//! This crate carries everything the verification engine layers agree on:
//! the workflow data model, the closed error taxonomy, configuration, the
//! versioned state store abstraction, and the typed gateway over the
//! partitioned event log.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Ingestion adapters                      │
//! │               (publish RawItems, keyed by source)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼  raw-items
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    veriflow-engine                          │
//! │     Supervisor ── partition workers ── Orchestrator         │
//! │     Review Coordinator │ Observer Plane │ Node Runtime      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌───────────────────┐    ┌─────────────────────────┐
//! │    State Store    │    │    Event Bus Gateway    │
//! │  (this crate)     │    │      (this crate)       │
//! │  CAS + TTL + pubsub│   │  topics, groups, DLQ    │
//! └───────────────────┘    └─────────────────────────┘
//! ```
//!
//! # Workflow status machine
//!
//! ```text
//!   ┌─────────┐ claim  ┌─────────┐  node ok   ┌─────────┐
//!   │ PENDING │───────▶│ RUNNING │──────────▶│ RUNNING │──▶ ...
//!   └─────────┘        └────┬────┘            └────┬────┘
//!                           │ risk ≥ τ             │ publish done
//!                           ▼                      ▼
//!                  ┌─────────────────┐       ┌───────────┐
//!                  │ AWAITING_REVIEW │       │ COMPLETED │
//!                  └────────┬────────┘       └───────────┘
//!                  decision │
//!                           ▼
//!                     ┌──────────┐  node begins  ┌─────────┐
//!                     │ RESUMING │──────────────▶│ RUNNING │
//!                     └──────────┘               └─────────┘
//!
//!   any non-terminal ──cancel──▶ CANCELLED
//!   retries exhausted / terminal kind ──▶ FAILED
//! ```
//!
//! Every status edge is CAS-guarded on the record version; out-of-order
//! transitions are rejected by [`model::WorkflowStatus::can_transition`].
//!
//! # Modules
//!
//! - [`model`]: workflow, claim, checkpoint and notification types
//! - [`error`]: the closed error taxonomy shared by every layer
//! - [`config`]: engine options loaded from `VERIFLOW_*` variables
//! - [`store`]: versioned KV + pub/sub abstraction and typed workflow layer
//! - [`bus`]: topic taxonomy, consumer groups, DLQ routing

#![deny(missing_docs)]

/// Topic taxonomy and the typed gateway over the partitioned log.
pub mod bus;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Closed error taxonomy shared by stages, store, bus and engine.
pub mod error;

/// Workflow, claim, checkpoint and notification types.
pub mod model;

/// Versioned state store abstraction with TTL, CAS and pub/sub.
pub mod store;
