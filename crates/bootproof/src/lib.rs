pub mod appliance;
pub mod assets;
pub mod broker;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod features;
pub mod model;
pub mod monitoring;
pub mod notify;
pub mod process;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod transaction;
pub mod verification;

pub use error::{Error, Result};
