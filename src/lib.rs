//! convoy: a host-side test invocation orchestrator.
//!
//! One invocation drives one configuration through a fixed stage pipeline
//! against a set of allocated devices, reporting progress to listeners as
//! it goes.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Config**: the declarative TOML schema and the runtime object graph
//!   (build provider, preparers, tests, options)
//! - **Invoker**: the stage sequencer and the per-run-mode execution paths
//! - **Results**: the listener event protocol and its consumers (console,
//!   JUnit XML, shard forwarding, in-memory recording)
//! - **Delegate**: subprocess and remote-VM execution with a streamed
//!   result-event wire format
//!
//! # Example
//!
//! ```no_run
//! use convoy::config::{build_configuration, load_config};
//! use convoy::invoker::{StopHandle, StubDeviceAllocator, TestInvocation};
//! use convoy::results::ListenerSet;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let file = load_config(std::path::Path::new("convoy.toml"))?;
//!     let config = build_configuration(&file);
//!     let invocation = TestInvocation::new(config, StopHandle::new());
//!     let exit = invocation
//!         .invoke(&StubDeviceAllocator, ListenerSet::new())
//!         .await;
//!     std::process::exit(exit as i32);
//! }
//! ```

pub mod build;
pub mod config;
pub mod context;
pub mod delegate;
pub mod device;
pub mod error;
pub mod invoker;
pub mod prep;
pub mod results;
pub mod retry;
pub mod shard;
pub mod testtype;

// Re-export commonly used types
pub use build::{BuildInfo, BuildProvider};
pub use config::{build_configuration, load_config, Configuration, RunMode};
pub use context::{InvocationContext, TestInformation};
pub use device::Device;
pub use error::{ExitCode, FailureDescription, InvocationError, InvocationResult};
pub use invoker::{ExecutionPath, StopHandle, TestInvocation};
pub use results::{InvocationListener, ListenerSet, TestRunResult};
pub use testtype::RemoteTest;
