pub mod config;
pub mod time;
pub mod types;

pub use config::SignalsConfig;
pub use time::{Clock, ManualClock, SystemClock};
pub use types::*;
