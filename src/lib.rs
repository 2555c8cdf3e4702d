// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![cfg_attr(not(test), deny(warnings))] // All warnings are errors outside tests
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![cfg_attr(not(test), deny(missing_docs))] // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Gangway Deploy EC2
//!
//! A declarative, idempotent provisioning and deployment-handoff system for
//! single AWS EC2 hosts.
//!
//! ## Overview
//!
//! Gangway takes one YAML declaration and converges reality toward it:
//!
//! - Declare one compute instance plus its network access rules
//! - Plan and apply changes idempotently, with remote state and locking
//! - Publish named outputs (`ec2_public_ip` and friends) for automation
//! - Gate on host readiness, then hand the deployment off over SSH
//!
//! ## Architecture
//!
//! The system is built around desired-state reconciliation:
//!
//! 1. **Declared state**: `gangway.deploy.yaml`
//! 2. **Applied state**: recorded in a locked state store (local or S3)
//! 3. **Observed state**: queried from the EC2 API
//! 4. **Reconciler**: diffs the three and executes an ordered change plan
//!
//! ## Modules
//!
//! - [`config`]: declaration parsing, validation, hashing
//! - [`state`]: state storage backends (local, S3) with locking
//! - [`aws`]: EC2 client and the compute provider capability
//! - [`planner`]: diff computation, change plans, plan execution
//! - [`reconciler`]: lock discipline and convergence
//! - [`outputs`]: named output publication
//! - [`readiness`]: TCP gate and HTTP application probe
//! - [`handoff`]: deployment handoff over capability traits
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: demo-api
//!   environment: prod
//!   region: us-east-1
//!
//! state:
//!   backend: s3
//!   bucket: demo-api-tfstate
//!   prefix: demo-api/prod
//!
//! instance:
//!   ami: ami-0953476d60561c955
//!   instance_type: t2.micro
//!   key_name: testkey
//!   ingress:
//!     - "22/tcp"
//!     - "80/tcp"
//!
//! outputs:
//!   - ec2_public_ip
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod aws;
pub mod cli;
pub mod config;
pub mod error;
pub mod handoff;
pub mod outputs;
pub mod planner;
pub mod readiness;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use error::{GangwayError, Result};
pub use aws::{ComputeProvider, Ec2Client, Ec2Provisioner};
pub use handoff::{HandoffNotifier, LogNotifier, Notifier, RemoteExecutor, SshRemoteExecutor};
pub use outputs::{OutputPublisher, OutputSet};
pub use planner::{ChangePlan, DiffEngine, PlanExecutor};
pub use readiness::{HttpProbe, ReadinessGate};
pub use reconciler::{ApplyReport, Reconciler};
pub use state::{AppliedState, LocalStateStore, S3StateStore, StateStore};
