//! AWS EC2 provider integration.
//!
//! Everything that talks to the provider lives here: the API client,
//! the compute capability trait, the provisioner implementing it, and
//! the spec/observed types shared with the planner.

mod client;
mod provider;
mod provisioner;
mod types;

pub use client::Ec2Client;
pub use provider::ComputeProvider;
pub use provisioner::Ec2Provisioner;
pub use types::{
    parse_run_state, system_tags, EnvironmentView, InstanceSpec, ObservedInstance,
    ObservedSecurityGroup, SecurityGroupSpec, TAG_DISPLAY_NAME, TAG_ENV, TAG_NAME, TAG_PROJECT,
    TAG_SPEC_HASH,
};
