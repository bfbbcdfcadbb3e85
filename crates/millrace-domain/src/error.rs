use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid entry status: {0}")]
    InvalidStatus(String),

    #[error("invalid partition segment: {0}")]
    InvalidPartitionSegment(String),

    #[error("invalid worker configuration: id {id} must be < count {count}")]
    InvalidWorker { id: u32, count: u32 },
}
