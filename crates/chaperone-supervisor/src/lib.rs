//! # chaperone-supervisor
//!
//! Process supervision engine for the chaperone wrapper.
//!
//! Consumes a resolved [`Configuration`](chaperone_core::Configuration)
//! and forks, monitors, restarts, and tears down the wrapped process.
//! Restart policy, capped exponential backoff, graceful stop with a
//! force-kill fallback, and live reload are all handled here; the
//! configuration model lives in `chaperone-core`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chaperone_core::{ConfigSource, PropertiesSource};
//! use chaperone_supervisor::{SupervisorController, SupervisorSettings};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sources: Vec<Arc<dyn ConfigSource>> =
//! 	vec![Arc::new(PropertiesSource::new("wrapper.cfg"))];
//!
//! let controller =
//! 	SupervisorController::new("myapp", sources, SupervisorSettings::default());
//! controller.start().await.unwrap();
//! let outcome = controller.wait().await;
//! println!("child finished: {:?}", outcome);
//! # }
//! ```

pub mod controller;
pub mod logs;
pub mod output;
pub mod state;
pub mod supervisor;

pub use controller::{ControlError, SupervisorController};
pub use output::OutputLog;
pub use state::{Status, SupervisorError, SupervisorState};
pub use supervisor::{backoff_delay, Supervisor, SupervisorSettings, LEVEL_ENV_VAR};
