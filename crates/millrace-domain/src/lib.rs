pub mod error;
pub mod types;


pub use error::DomainError;
pub use types::{
    AddOptions, Entry, EntryFilter, EntryId, EntryStatus, PartitionPath, StatusChange,
};
