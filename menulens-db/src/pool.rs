use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PoolError};

pub type ConnectionPool = Pool<ConnectionManager<PgConnection>>;

pub fn get_pool(url: &str, max_size: u32) -> Result<ConnectionPool, PoolError> {
    let manager = ConnectionManager::new(url);

    Pool::builder().max_size(max_size).build(manager)
}
