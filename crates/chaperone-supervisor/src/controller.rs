use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use chaperone_core::{resolver, ConfigError, ConfigSource, Configuration};

use crate::output::OutputLog;
use crate::state::{Status, SupervisorError};
use crate::supervisor::{Supervisor, SupervisorSettings};

/// Either half of the system can fail a control operation.
#[derive(Debug)]
pub enum ControlError {
	Config(ConfigError),
	Supervisor(SupervisorError),
}

impl std::fmt::Display for ControlError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ControlError::Config(e) => write!(f, "{}", e),
			ControlError::Supervisor(e) => write!(f, "{}", e),
		}
	}
}

impl std::error::Error for ControlError {}

impl From<ConfigError> for ControlError {
	fn from(e: ConfigError) -> Self {
		ControlError::Config(e)
	}
}

impl From<SupervisorError> for ControlError {
	fn from(e: SupervisorError) -> Self {
		ControlError::Supervisor(e)
	}
}

/// Top-level lifecycle owner: one ordered set of configuration sources,
/// one supervisor, no global state. Several controllers can coexist in
/// the same process, each wrapping an independent child.
pub struct SupervisorController {
	sources: Vec<Arc<dyn ConfigSource>>,
	supervisor: Arc<Supervisor>,
	current: RwLock<Option<Arc<Configuration>>>,
}

impl SupervisorController {
	pub fn new(
		name: impl Into<String>,
		sources: Vec<Arc<dyn ConfigSource>>,
		settings: SupervisorSettings,
	) -> Self {
		Self {
			sources,
			supervisor: Supervisor::new(name, settings),
			current: RwLock::new(None),
		}
	}

	/// Resolves the sources and launches the child. A configuration
	/// error is fatal to startup: nothing is forked.
	pub async fn start(&self) -> Result<Arc<Configuration>, ControlError> {
		let config = Arc::new(resolver::merge(&self.sources).await?);
		self.supervisor.start(Arc::clone(&config)).await?;
		*self.current.write().await = Some(Arc::clone(&config));
		Ok(config)
	}

	/// Re-resolves the sources and applies the result to the running
	/// child. A configuration error is reported but leaves the child
	/// running under the previous configuration.
	pub async fn reload(&self) -> Result<Arc<Configuration>, ControlError> {
		let config = match resolver::merge(&self.sources).await {
			Ok(config) => Arc::new(config),
			Err(e) => {
				tracing::warn!("reload failed, keeping current configuration: {}", e);
				return Err(e.into());
			}
		};
		self.supervisor.reload(Arc::clone(&config)).await?;
		*self.current.write().await = Some(Arc::clone(&config));
		Ok(config)
	}

	pub async fn stop(&self, grace: Option<Duration>) -> Result<(), SupervisorError> {
		self.supervisor.stop(grace).await
	}

	pub async fn status(&self) -> Status {
		self.supervisor.status().await
	}

	pub async fn current(&self) -> Option<Arc<Configuration>> {
		self.current.read().await.clone()
	}

	pub async fn output(&self) -> Option<OutputLog> {
		self.supervisor.output().await
	}

	/// Blocks until the supervised instance terminates.
	pub async fn wait(&self) -> Result<Status, SupervisorError> {
		self.supervisor.wait().await
	}
}
