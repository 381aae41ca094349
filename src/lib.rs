pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod io;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod transport;
pub mod utils;

pub mod prelude;
