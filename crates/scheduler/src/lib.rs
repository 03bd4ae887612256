//!
//! # Scheduler
//!
//! The reconciliation engine of the network configuration agent. It keeps the desired
//! configuration received from the northbound plane in sync with the objects actually present in
//! the forwarding engine, modelling everything as key-value pairs with dependencies between them.
//!
//! Bring one [`Descriptor`] per configuration object type and the scheduler takes care of:
//! - Creating, updating and deleting objects in dependency order;
//! - Parking values whose dependencies are missing and applying them as soon as they show up;
//! - Taking dependents down before the objects they depend on, and bringing them back afterwards;
//! - Derived values, split out of their parent and managed on their own;
//! - Resyncs that read back the forwarding engine and correct any drift;
//! - Dry runs, transaction history and a per-key status feed;
//!
//!
//! ## Basic example
//!
//! ```
//! use nca_scheduler::{
//!     Descriptor, MetadataStore, OperationError, Registry, Scheduler, SchedulerConfig,
//!     SharedMetadata, Transaction, Value, ValueStatus,
//! };
//! use async_trait::async_trait;
//!
//! struct Loopbacks;
//!
//! #[async_trait]
//! impl Descriptor for Loopbacks {
//!     fn name(&self) -> &str {
//!         "loopback"
//!     }
//!
//!     fn key_prefix(&self) -> Option<&str> {
//!         Some("lo/")
//!     }
//!
//!     async fn create(
//!         &self,
//!         _key: &str,
//!         _value: &dyn Value,
//!     ) -> Result<Option<SharedMetadata>, OperationError> {
//!         Ok(None)
//!     }
//!
//!     async fn delete(
//!         &self,
//!         _key: &str,
//!         _value: &dyn Value,
//!         _metadata: Option<SharedMetadata>,
//!     ) -> Result<(), OperationError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut builder = Registry::builder();
//!     builder.register(Loopbacks).unwrap();
//!
//!     let scheduler = Scheduler::new(
//!         builder.build().unwrap(),
//!         MetadataStore::new(),
//!         SchedulerConfig::default(),
//!     );
//!
//!     let report = scheduler
//!         .submit(Transaction::new().put("lo/0", String::from("127.0.0.1/8")))
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(report.outcome("lo/0"), Some(&ValueStatus::Applied));
//!
//!     scheduler.shutdown().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod config;
mod descriptor;
mod error;
mod executor;
mod graph;
mod message;
mod metadata;
mod order;
mod pending;
mod record;
mod registry;
mod resync;
mod scheduler;
mod status;
mod txn;
mod value;
mod worker;

pub use config::SchedulerConfig;
pub use descriptor::Descriptor;
pub use error::{Error, KeyError, OperationError, ValidationError};
pub use graph::{ValueState, ValueView};
pub use metadata::MetadataStore;
pub use record::{RecordedOp, RecordedValue, TxnRecord};
pub use registry::{Registry, RegistryBuilder};
pub use resync::ResyncStrategy;
pub use scheduler::Scheduler;
pub use status::{KeyOutcome, StatusEvent, StatusWatcher, ValueStatus};
pub use txn::{
	RetrieveFailure, Transaction, TxnItem, TxnKind, TxnOperation, TxnOptions, TxnReport,
};
pub use value::{
	cast, AnyOf, Dependency, DependencyTarget, Key, KeySelector, KeyValuePair, KvWithMetadata,
	Metadata, Origin, SharedMetadata, SharedValue, Value,
};
