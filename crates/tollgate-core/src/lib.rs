pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TollgateError};
pub use event::EventBus;
pub use state::StateRecord;
pub use types::*;
