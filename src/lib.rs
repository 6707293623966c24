//! Agora — deployment lifecycle and feedback analytics back-end for an
//! AI-agent marketplace.
//!
//! ## Overview
//!
//! Creators register agent deployments, gate them behind subscription
//! tiers, and drive them through a `pending → deploying → active ⇄ stopped`
//! lifecycle (with `failed` as a recoverable sink). Users record executions
//! and leave one review per deployment; reviews are sentiment-tagged at
//! ingestion and aggregated on demand into summaries and trend analytics.
//! Every status or metrics change fans out over WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         ├─ lifecycle.rs (LifecycleManager,       │
//!                       │         │                ReadinessProbe)         │
//!                       │         ├─ feedback.rs  (ingest, summarize,      │
//!                       │         │                analyze)                │
//!                       │         │     └─ sentiment.rs (keyword tagger)   │
//!                       │         v                                        │
//!                       │  relay.rs  (StatusRelay, per-deployment topics)  │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  ws.rs   (socket loop, ping/pong keepalive)      │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                            |
//! |-----------|-----------------------------------------------------------|
//! | `models`  | Shared types: `Deployment`, `AgentFeedback`, status enums |
//! | `db`      | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)       |
//! | `errors`  | `MarketError` taxonomy and JSON error envelope            |

pub mod api;
pub mod db;
pub mod errors;
pub mod feedback;
pub mod lifecycle;
pub mod models;
pub mod relay;
pub mod sentiment;
pub mod server;
pub mod ws;
