//! loom peer scheduling core
//!
//! Every node is both a submitter and an executor. A submitting node splits
//! a task into sub-tasks, ranks its directly connected peers by observed
//! performance and sends each sub-task to one of them.
//!
//! # Architecture
//!
//! ```text
//!            submit(task)
//!                 │
//!           ┌─────▼─────┐  rank   ┌───────────┐
//!           │ Scheduler │────────►│ PeerStore │◄──── update ────┐
//!           └─────┬─────┘         └───────────┘                 │
//!        register │ send                                  ┌─────┴──────┐
//!                 ▼                                       │ Aggregator │
//!      ┌────────────────────┐  job results                └─────▲──────┘
//!      │ ConnectionRegistry │───────────────────────────────────┘
//!      └─────────┬──────────┘
//!                │ job requests
//!          ┌─────▼─────┐
//!          │  Peer B   │ runs its ExecutionProvider
//!          └───────────┘
//! ```
//!
//! ## Settlement
//! - Each sub-task gets one pending assignment with a deadline
//! - The first of result, timeout or disconnect settles it; the rest are no-ops
//! - A task resolves once all sub-tasks settled; zero successes means fallback
//!
//! ## Legacy pipeline
//! - Plain numeric jobs are split into balanced chunks and reduced after
//!   every chunk reported (see [`pipeline`])

pub mod aggregator;
pub mod error;
pub mod frame;
pub mod message;
pub mod node;
pub mod peer;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use error::{Error, ProviderError, Result};
pub use message::PeerMessage;
pub use node::Node;
pub use peer::{PeerRecord, PeerStore};
pub use provider::{BuiltinProvider, ExecutionProvider, HttpProvider, ProviderOutput};
pub use registry::{ConnectionRegistry, Connector, PeerChannel};
pub use scheduler::Scheduler;
pub use types::*;
