mod schema;
mod url;

pub mod db;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod store;
pub mod types;

pub(crate) use schema::*;

pub use pool::{ConnectionPool, get_pool};
pub use store::{MemoryStore, PgStore, SessionStore, StoreError};
pub use url::postgres_url_from_environment;

pub use diesel::r2d2::PoolError;
pub use diesel::{Connection, PgConnection};

pub type QueryError = diesel::result::Error;
pub type QueryResult<T> = Result<T, QueryError>;
