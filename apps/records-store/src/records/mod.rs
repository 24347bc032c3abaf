pub mod compare;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod hashing;
pub mod mirror;
pub mod patch;
pub mod router;
pub mod service;
pub mod store;
pub mod types;


pub use error::{RecordsError, RecordsStoreError};
pub use router::{MigrationPhase, MigrationRouter};
pub use service::RecordsService;
