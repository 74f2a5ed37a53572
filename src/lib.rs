pub mod agents;
pub mod api;
pub mod backend;
pub mod browser;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod store;

pub use error::{RelayError, Result};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use browser::BrowserManager;
pub use scheduler::EolSweepScheduler;
pub use session::SessionTracker;
pub use store::Store;
