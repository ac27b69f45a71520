pub mod block;
pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod fileset;
pub mod flock;
pub mod hasher;
pub mod memtable;
pub mod row;
pub mod schema;
pub mod state;

pub use config::{CommitConfig, RetentionConfig};
pub use engine::Tsdb;
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use row::{Cell, Key, TableId, Value};
pub use schema::{Schema, SchemaRegistry, SchemaSource};
