pub mod client;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod mapper;
pub mod records;
pub mod scheduler;
pub mod sync;
pub mod upload;

pub use error::SyncError;
