#[macro_use]
extern crate log;

pub use db::Database;

pub mod catalog;
pub mod db;
pub mod error;
mod hash;
pub mod heap;
pub mod index;
mod ioutils;
pub mod query;
pub mod schema;

pub type Result<T> = std::result::Result<T, error::RelLiteError>;
