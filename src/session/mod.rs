pub mod state;

mod connection;

pub use connection::{Database, DatabaseBuilder, FetchResult, InitHook, Session};
pub use state::TransactionState;
