//! # chaperone-core
//!
//! Configuration model and resolution for the chaperone process wrapper.
//!
//! Raw attributes flow in from heterogeneous sources — flat properties
//! files, TOML files, scripts evaluated by an external interpreter —
//! and are merged with defined precedence into one validated, immutable
//! [`Configuration`]. Pairs with `chaperone-supervisor`, which consumes
//! the configuration to fork and babysit the wrapped process.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chaperone_core::{resolver, InlineSource, PropertiesSource, RawAttrs};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut overrides = RawAttrs::new();
//! overrides.set_str("level", "FINE");
//!
//! let sources: Vec<Arc<dyn chaperone_core::ConfigSource>> = vec![
//! 	Arc::new(PropertiesSource::new("/etc/myapp/wrapper.cfg")),
//! 	Arc::new(InlineSource::new("command line", overrides)),
//! ];
//!
//! let config = resolver::merge(&sources).await.unwrap();
//! assert!(!config.main.is_empty());
//! # }
//! ```

pub mod attrs;
pub mod cmdline;
pub mod config;
pub mod error;
pub mod resolver;
pub mod script;
pub mod source;

pub use attrs::{ArgMode, RawAttrs};
pub use config::{Configuration, LogLevel, RestartPolicy};
pub use error::ConfigError;
pub use script::{InterpreterEngine, ScriptContext, ScriptEngine, ScriptFailure, ScriptSource};
pub use source::{
	source_for_path, ConfigSource, InlineSource, PropertiesSource, TomlSource,
	DEFAULT_RESOLVE_TIMEOUT,
};
