//! Delegated execution: running the test phases outside this process.
//!
//! Two delegation paths exist. [`subprocess`] spawns a child of this same
//! program and receives its results over a local TCP stream. [`remote`]
//! pushes the whole invocation to a remote VM and polls for result files.
//! Both speak the [`wire`] event format.

pub mod remote;
pub mod subprocess;
pub mod wire;

pub use remote::{RemoteDelegate, RemoteTransport, SshTransport, DONE_MARKER};
pub use subprocess::{connect_reporter, report_port_from_env, SubprocessDelegate, REPORT_PORT_ENV};
pub use wire::{EventStreamReader, EventStreamWriter, ResultEvent, StreamingListener};
