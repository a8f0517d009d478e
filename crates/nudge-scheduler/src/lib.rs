pub mod config;
pub mod manager;
pub mod scheduler;
pub mod state;

pub use config::*;
pub use manager::*;
pub use scheduler::*;
pub use state::*;
