// Social-graph API access: credential rotation, the page fetcher, the typed
// response schema, and the audit files every fetch writes to.

pub mod audit;
pub mod client;
pub mod credentials;
pub mod error;
pub mod response;

pub use audit::AuditLog;
pub use client::{FollowingClient, PageSource, DEFAULT_FOLLOWING_URL};
pub use credentials::CredentialPool;
pub use error::{EmptyPoolError, FetchError, RecordParseError};
pub use response::{parse_account, Page};
