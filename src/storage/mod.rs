pub mod comments;
pub mod db;
pub mod error;
pub mod files;
pub mod operations;
pub(crate) mod schema;
