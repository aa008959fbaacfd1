//! Sandbox sync client.
//!
//! Mirrors a remote SCM stream or repository workspace into a local sandbox,
//! reports local changes against the mirror and checks them back in.

pub mod checkin;
pub mod config;
pub mod error;
pub mod load;
pub mod metadata;
pub mod remote;
pub mod sandbox;
pub mod status;
pub mod transport;

pub use checkin::{CheckinCoordinator, CheckinOutcome, CheckinSummary};
pub use config::Settings;
pub use error::{Result, SyncError};
pub use load::{LoadOptions, LoadSummary, LoadTarget, SandboxLoader};
pub use metadata::{MetadataRecord, MetadataStore, SandboxMetadata};
pub use remote::{HttpScmService, RemoteNode, RemoteRoot, ScmService};
pub use sandbox::ignore::{IgnorePredicate, JazzIgnore, SharedIgnore};
pub use sandbox::Sandbox;
pub use status::{detect_changes, ChangeSet};
pub use transport::{AuthenticatingTransport, Credentials};
