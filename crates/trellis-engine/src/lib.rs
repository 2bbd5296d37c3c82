//! Trellis Engine
//!
//! This crate advances long-running processes through their definitions and
//! guarantees that no process is advanced by two workers at once.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Worker                               │
//! │  - tick: schedule dispatch, claim due jobs, run them        │
//! │  - start(cancel) runs the tick loop                         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ProcessEngine                           │
//! │  - start / save / remove → HookRegistry                     │
//! │  - run_job: sweep, continuation or dispatch                 │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌────────────────┐  ┌───────────────────┐  ┌─────────────────┐
//! │  JobScheduler  │  │    FlowAdvancer   │  │  LockManager    │
//! │  sequential /  │  │  nodes → actions, │  │  acquire /      │
//! │  parallel      │  │  conditions       │  │  release        │
//! └────────────────┘  └───────────────────┘  └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let store = Arc::new(SqliteStore::connect("sqlite://trellis.db").await?);
//! store.migrate().await?;
//!
//! let engine = Arc::new(ProcessEngine::builder(store.clone(), store).build()?);
//! engine.register_definition(def)?;
//!
//! let cancel = CancellationToken::new();
//! Worker::new(engine.clone()).start(cancel).await?;
//! ```

mod advancer;
mod definitions;
mod engine;
mod error;
mod events;
mod hooks;
mod lock;
mod runner;
mod scheduler;

pub use advancer::{AdvanceOutcome, AdvanceReport, FlowAdvancer, PROCESS_ENTITY_TYPE, SweepReport};
pub use definitions::DefinitionRegistry;
pub use engine::{EngineBuilder, ProcessEngine};
pub use error::EngineError;
pub use events::{ChannelNotifier, NoopNotifier, ProcessEvent, ProcessNotifier, Signal, SignalBus};
pub use hooks::{
  AutoStart, DeferredReactivation, HookRegistry, LifecycleHook, Record, RejectFlowNodes,
  SaveOptions, StartProcess, SubProcessCascade,
};
pub use lock::{LockManager, LockOutcome};
pub use runner::{TickReport, Worker};
pub use scheduler::JobScheduler;
