//! Agent fleet service: per-container instruction queues and the real-time
//! event fabric around them.
//!
//! ## Overview
//!
//! Each agent container gets its own priority queue and a worker task that
//! runs one instruction at a time through an [`InstructionExecutor`]
//! (Docker exec in production). Queue lifecycle, container output and
//! resource samples are pushed to WebSocket clients over channels keyed by
//! container id.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (Router, wiring, shutdown)           │
//! │          │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (Session, rate-limit interceptor)  │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  queue.rs  (QueueManager → InstructionQueue)     │
//!                       │         │  worker.rs (one task per container)    │
//!                       │         v                                        │
//!                       │  sandbox.rs  (DockerSandbox: exec, logs, stats)  │
//!                       │                                                  │
//!                       │  broadcaster.rs ← subscriptions.rs               │
//!                       │    ├─ logs.rs    (tail on first log subscriber)  │
//!                       │    └─ metrics.rs (sampler on first subscriber)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | Wire types: receipts, queue status, events, log pages   |
//! | `db`          | SQLite access via `DbHandle` (`spawn_blocking`)         |
//! | `rate_limit`  | Sliding-window limiter per connection and tier          |
//!
//! [`InstructionExecutor`]: fleet_common::InstructionExecutor

pub mod api;
pub mod broadcaster;
pub mod db;
pub mod logs;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod rate_limit;
pub mod sandbox;
pub mod server;
pub mod subscriptions;
pub mod worker;
pub mod ws;
