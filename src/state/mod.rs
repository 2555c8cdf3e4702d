//! State management module for the Gangway provisioning system.
//!
//! Persistent applied-state storage with mutual exclusion: the state
//! object records provider-confirmed resources, the lock record
//! serializes writers per environment.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::LocalStateStore;
pub use s3::S3StateStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use types::{
    AppliedState, ApplyHistoryEntry, ApplyOperation, InstanceRunState, InstanceState,
    SecurityGroupState, STATE_VERSION,
};
