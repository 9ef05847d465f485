pub mod connector;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod mount;
pub mod progress;
pub mod queue;
pub mod remote;
pub mod secrets;
pub mod session;
pub mod share;
pub mod subprocess;
pub mod transfer_engine;

pub use connector::{ConnectorOptions, Enumeration, ShareConnector, Strategy};
pub use diagnostics::{DiagnosticReport, Diagnostics};
pub use error::{
    ConnectError, ListingError, MountError, QueueError, RunError, SecretError, TransferError,
};
pub use models::{Credential, Job, JobInputs, JobState};
pub use mount::{ConflictGroups, MountCoordinator, MountOptions};
pub use progress::parse_progress;
pub use queue::{JobQueue, QueueEvent, QueueOptions};
pub use remote::{ListingAuth, MountAuth, RemoteAdapter};
pub use secrets::{MemorySecretStore, SecretStore};
pub use session::RemoteSession;
pub use share::Share;
pub use subprocess::{CommandSpec, SubprocessRunner};
