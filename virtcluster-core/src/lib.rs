//! Virtcluster core library
//!
//! Lifecycle orchestration for a multi-node cluster running as libvirt
//! domains on the local host: storage pool, networks, node domains and the
//! readiness gate.

// Configuration
pub mod config;
pub mod logging;

// Hypervisor access
pub mod hypervisor;

// Rendering
pub mod template;

// Managed resources
pub mod storage;
pub mod network;
pub mod domain;

// External collaborators
pub mod image;
pub mod discovery;
pub mod readiness;
pub mod kubeconfig;
pub mod ssh;

// Lifecycle
pub mod orchestrator;

pub use config::VirtclusterConfig;
pub use hypervisor::{HypervisorClient, HypervisorError, VirshClient};
pub use orchestrator::{ClusterOrchestrator, ClusterState, PushMode, UpOutcome};
pub use readiness::{ReadinessOutcome, ReadinessPoller};
