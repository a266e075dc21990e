//! ABCI application core with optimistic concurrent transaction execution.
//!
//! This crate provides the base application a Cosmos-style chain is built
//! on: branching state, the per-transaction Ante → Dispatch → Validate
//! pipeline, the block phase state machine and an executor that runs a
//! block's transactions in parallel while producing the same state as
//! sequential execution.
//!
//! # Architecture
//!
//! The crate is organized around four main concepts:
//!
//! - **Store**: a committed root plus copy-on-write branches that record
//!   every access ([`store`])
//! - **Pipeline**: ante handler, message routing, access validation and
//!   panic recovery for one transaction ([`pipeline`])
//! - **Executor**: a strategy for delivering a batch, sequential or OCC
//!   ([`executor`])
//! - **App**: the long-lived phase states and the ABCI surface ([`app`])
//!
//! # Quick Start
//!
//! ```
//! use occ_baseapp::app::types::{RequestFinalizeBlock, RequestInitChain};
//! use occ_baseapp::config::AppConfig;
//! use occ_baseapp::workload::{bank, Workload, WorkloadConfig};
//!
//! let workload = Workload::generate(WorkloadConfig {
//!     num_accounts: 20,
//!     num_transactions: 10,
//!     ..WorkloadConfig::default()
//! })
//! .unwrap();
//!
//! let config = AppConfig {
//!     chain_id: "demo".into(),
//!     concurrency_workers: 4,
//!     ..AppConfig::default()
//! };
//! let mut app = bank::app_builder("demo", config, workload.config.chain_id)
//!     .build()
//!     .unwrap();
//!
//! app.init_chain(&RequestInitChain {
//!     chain_id: "demo".into(),
//!     initial_height: 1,
//!     app_state_bytes: serde_json::to_vec(&workload.genesis()).unwrap(),
//!     ..RequestInitChain::default()
//! })
//! .unwrap();
//!
//! let res = app
//!     .finalize_block(&RequestFinalizeBlock {
//!         height: 1,
//!         txs: workload.transactions.clone(),
//!         ..RequestFinalizeBlock::default()
//!     })
//!     .unwrap();
//! assert!(res.tx_results.iter().all(|r| r.is_ok()));
//! app.commit().unwrap();
//! ```

pub mod acl;
pub mod app;
pub mod bundle;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod gas;
pub mod pipeline;
pub mod recovery;
pub mod router;
pub mod store;
pub mod tx;
pub mod workload;

pub use app::{BaseApp, BaseAppBuilder};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use executor::{BatchExecutor, OccExecutor, SequentialExecutor};
