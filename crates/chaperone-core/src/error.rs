use std::time::Duration;

/// Errors from configuration resolution.
///
/// Every variant carries enough context (source description, attribute
/// name, underlying message) to make a bad configuration diagnosable
/// without re-running the resolution.
#[derive(Debug)]
pub enum ConfigError {
	/// A static source's underlying text could not be read or parsed.
	ParseFailure { source: String, message: String },
	/// A script raised an error, returned a malformed value, or its
	/// interpreter could not be launched.
	ScriptError { source: String, message: String },
	/// Source resolution exceeded its hard time limit.
	Timeout { source: String, limit: Duration },
	/// A required attribute was absent from every source.
	MissingRequiredField { field: &'static str },
	/// An attribute was present but failed type coercion or validation.
	InvalidValue { field: String, message: String },
}

impl std::fmt::Display for ConfigError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ConfigError::ParseFailure { source, message } => {
				write!(f, "{}: parse failure: {}", source, message)
			}
			ConfigError::ScriptError { source, message } => {
				write!(f, "{}: script error: {}", source, message)
			}
			ConfigError::Timeout { source, limit } => {
				write!(f, "{}: evaluation timed out after {}ms", source, limit.as_millis())
			}
			ConfigError::MissingRequiredField { field } => {
				write!(f, "required attribute '{}' is missing", field)
			}
			ConfigError::InvalidValue { field, message } => {
				write!(f, "invalid value for '{}': {}", field, message)
			}
		}
	}
}

impl std::error::Error for ConfigError {}
