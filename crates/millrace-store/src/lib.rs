pub mod error;
pub mod store;
pub mod memory;
pub mod file;
pub mod sqlite_store;
pub mod postgres_store;
pub mod redis_store;
pub mod mongo_store;

pub use error::StoreError;
pub use store::QueueStore;
pub use memory::MemoryStore;
pub use file::FileStore;
pub use sqlite_store::SqliteStore;
pub use postgres_store::PostgresStore;
pub use redis_store::RedisStore;
pub use mongo_store::MongoStore;
