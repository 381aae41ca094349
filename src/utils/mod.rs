pub use activity::*;
pub use backoff::*;
pub use cancel_token::*;
pub use core_pinner::*;
pub use rate::*;

mod activity;
mod backoff;
mod cancel_token;
mod core_pinner;
pub mod logger;
mod rate;
