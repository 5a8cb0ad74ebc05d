#[cfg(feature = "anticache")]
pub mod anticache;
pub mod context;
pub mod datum;
pub mod export;
pub mod heap;
pub mod index;
pub mod recovery;
pub mod schema;
pub mod snapshot;
pub mod table;
pub mod tuple;
pub mod undo;
pub mod view;
