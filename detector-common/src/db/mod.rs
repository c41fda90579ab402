//! Shared database bootstrap and the declarative schema-sync infrastructure
//! every crate's own `db::schema` module builds on.

pub mod init;
pub mod schema_sync;

pub use init::{init_database, init_database_from_url};
