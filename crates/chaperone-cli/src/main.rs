mod args;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use owo_colors::OwoColorize;
use tokio::signal::unix::{signal, SignalKind};

use chaperone_core::attrs::keys;
use chaperone_core::{
	source_for_path, ConfigSource, InlineSource, InterpreterEngine, LogLevel, RawAttrs,
	ScriptEngine, DEFAULT_RESOLVE_TIMEOUT,
};
use chaperone_supervisor::{SupervisorController, SupervisorSettings};

#[tokio::main]
async fn main() {
	let opts = match args::parse(std::env::args().skip(1)) {
		Ok(opts) => opts,
		Err(e) => {
			eprintln!("chaperone: {}", e);
			eprintln!("run 'chaperone --help' for usage");
			std::process::exit(2);
		}
	};

	if opts.help {
		print_usage();
		return;
	}
	if opts.version {
		println!("chaperone {}", env!("CARGO_PKG_VERSION"));
		return;
	}

	if let Err(e) = init_tracing(&opts) {
		eprintln!("chaperone: {}", e);
		std::process::exit(2);
	}

	let sources = match build_sources(&opts) {
		Ok(sources) => sources,
		Err(e) => {
			eprintln!("chaperone: {}", e);
			std::process::exit(1);
		}
	};
	if sources.is_empty() {
		eprintln!("chaperone: no configuration given");
		eprintln!("run 'chaperone --help' for usage");
		std::process::exit(2);
	}

	let controller =
		SupervisorController::new(instance_name(&opts), sources, build_settings(&opts));

	let config = match controller.start().await {
		Ok(config) => config,
		Err(e) => {
			eprintln!("chaperone: {}", e);
			std::process::exit(1);
		}
	};
	tracing::info!(
		"wrapping '{}' (restart {}, level {})",
		config.main,
		config.restart.as_str(),
		config.level.as_str()
	);

	match run(&controller).await {
		Ok(code) => std::process::exit(code),
		Err(e) => {
			eprintln!("chaperone: {}", e);
			std::process::exit(1);
		}
	}
}

/// Foreground control loop: relay signals to the controller and exit
/// with the wrapped process's last exit code.
async fn run(controller: &SupervisorController) -> std::io::Result<i32> {
	let mut sigterm = signal(SignalKind::terminate())?;
	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sighup = signal(SignalKind::hangup())?;

	loop {
		tokio::select! {
			_ = sigterm.recv() => {
				tracing::info!("received SIGTERM, stopping");
				if let Err(e) = controller.stop(None).await {
					tracing::warn!("stop: {}", e);
				}
			}
			_ = sigint.recv() => {
				tracing::info!("received SIGINT, stopping");
				if let Err(e) = controller.stop(None).await {
					tracing::warn!("stop: {}", e);
				}
			}
			_ = sighup.recv() => {
				tracing::info!("received SIGHUP, reloading configuration");
				match controller.reload().await {
					Ok(config) => tracing::info!(
						"configuration reloaded (restart {}, level {})",
						config.restart.as_str(),
						config.level.as_str()
					),
					Err(e) => tracing::warn!("reload rejected: {}", e),
				}
			}
			outcome = controller.wait() => {
				return Ok(match outcome {
					Ok(status) => {
						let code = status.last_exit_code.unwrap_or(0);
						tracing::info!("wrapped process finished with exit code {}", code);
						code
					}
					Err(e) => {
						eprintln!("chaperone: {}", e);
						1
					}
				});
			}
		}
	}
}

fn init_tracing(opts: &args::Options) -> Result<(), String> {
	use tracing_subscriber::filter::LevelFilter;

	let level = match &opts.level {
		Some(text) => LogLevel::parse(text)
			.ok_or_else(|| format!("unrecognized level '{}'", text))?,
		None => LogLevel::Info,
	};
	let filter = match level {
		LogLevel::Off => LevelFilter::OFF,
		LogLevel::Severe => LevelFilter::ERROR,
		LogLevel::Warning => LevelFilter::WARN,
		LogLevel::Info => LevelFilter::INFO,
		LogLevel::Fine => LevelFilter::DEBUG,
		LogLevel::All => LevelFilter::TRACE,
	};
	tracing_subscriber::fmt()
		.with_max_level(filter)
		.with_target(false)
		.init();
	Ok(())
}

fn build_sources(opts: &args::Options) -> Result<Vec<Arc<dyn ConfigSource>>, String> {
	let engine: Option<Arc<dyn ScriptEngine>> = if opts.interpreter.is_empty() {
		None
	} else {
		Some(Arc::new(InterpreterEngine::new(opts.interpreter.clone())))
	};
	let script_timeout = opts.script_timeout.unwrap_or(DEFAULT_RESOLVE_TIMEOUT);
	let script_env = args::env_overrides(opts);

	let mut paths: Vec<PathBuf> = Vec::new();
	if let Some(dir) = &opts.config_dir {
		let entries =
			std::fs::read_dir(dir).map_err(|e| format!("{}: {}", dir.display(), e))?;
		let mut found: Vec<PathBuf> = entries
			.flatten()
			.map(|entry| entry.path())
			.filter(|path| is_recognized(path))
			.collect();
		found.sort();
		paths.extend(found);
	}
	paths.extend(opts.configs.iter().cloned());

	let mut sources: Vec<Arc<dyn ConfigSource>> = Vec::new();
	for path in &paths {
		let source = source_for_path(path, engine.as_ref(), script_timeout, &script_env)
			.map_err(|e| e.to_string())?;
		sources.push(source);
	}

	let overrides = cli_overrides(opts);
	if !overrides.is_empty() {
		sources.push(Arc::new(InlineSource::new("command line", overrides)));
	}
	Ok(sources)
}

fn is_recognized(path: &Path) -> bool {
	matches!(
		path.extension().and_then(|e| e.to_str()),
		Some("cfg" | "conf" | "properties" | "toml" | "js")
	)
}

/// Command-line options become the highest-precedence source.
fn cli_overrides(opts: &args::Options) -> RawAttrs {
	let mut attrs = RawAttrs::new();
	if let Some(main) = &opts.main {
		attrs.set_str(keys::MAIN, main);
	}
	if let Some(level) = &opts.level {
		attrs.set_str(keys::LEVEL, level);
	}
	if let Some(cwd) = &opts.cwd {
		attrs.set_str(keys::DIR, cwd.display().to_string());
	}
	if let Some(policy) = &opts.restart {
		attrs.set_str(keys::RESTART, policy);
	}
	if let Some(n) = opts.max_restarts {
		attrs.set_u64(keys::MAX_RESTARTS, n);
	}
	if let Some(ms) = opts.backoff_initial_ms {
		attrs.set_u64(keys::BACKOFF_INITIAL_MS, ms);
	}
	if let Some(ms) = opts.backoff_max_ms {
		attrs.set_u64(keys::BACKOFF_MAX_MS, ms);
	}
	for (name, value) in &opts.setenv {
		attrs.set_env(name, value);
	}
	for arg in &opts.app_args {
		attrs.push_arg(arg);
	}
	attrs
}

fn build_settings(opts: &args::Options) -> SupervisorSettings {
	let mut settings = SupervisorSettings::default();
	if let Some(dir) = &opts.log_dir {
		settings.log_dir = dir.clone();
	}
	if let Some(grace) = opts.grace {
		settings.grace = grace;
	}
	if let Some(stability) = opts.stability {
		settings.stability = stability;
	}
	settings.echo = !opts.quiet;
	settings
}

fn instance_name(opts: &args::Options) -> String {
	opts.configs
		.first()
		.and_then(|path| path.file_stem())
		.and_then(|stem| stem.to_str())
		.map(|stem| stem.trim_end_matches(".cfg").to_string())
		.unwrap_or_else(|| "app".to_string())
}

fn print_usage() {
	eprintln!(
		"{} {} — scriptable process wrapper",
		"chaperone".bold(),
		env!("CARGO_PKG_VERSION")
	);
	eprintln!();
	eprintln!("usage: {} [options] [-- app-arg...]", "chaperone".bold());
	eprintln!();

	eprintln!("{}", "configuration".cyan().bold());
	eprintln!("  {} <file>     Add a configuration source (.cfg, .toml, .js);", "-c, --configuration".bold());
	eprintln!("                           later files override earlier ones");
	eprintln!("  {} <dir>  Load every recognized file in a directory", "-C, --configuration-directory".bold());
	eprintln!("  {} <command>     Interpreter for .js sources, e.g. 'node -'", "--interpreter".bold());
	eprintln!("  {} <secs>     Script evaluation deadline (default 30)", "--script-timeout".bold());
	eprintln!();

	eprintln!("{}", "launch overrides".cyan().bold());
	eprintln!("  {} <command>            Entry point for the wrapped process", "-m, --main".bold());
	eprintln!("  {} <level>             OFF SEVERE WARNING INFO FINE ALL", "-L, --level".bold());
	eprintln!("  {} <dir>                  Working directory for the child", "--cwd".bold());
	eprintln!("  {} <NAME=value>         Environment override (repeatable)", "-E, --setenv".bold());
	eprintln!();

	eprintln!("{}", "restart policy".cyan().bold());
	eprintln!("  {} <policy>           NEVER, ON_FAILURE or ALWAYS", "--restart".bold());
	eprintln!("  {} <n>           Restart budget, 0 = unlimited", "--max-restarts".bold());
	eprintln!("  {} <ms>        First restart delay (doubles, capped)", "--backoff-initial".bold());
	eprintln!("  {} <ms>            Restart delay cap", "--backoff-max".bold());
	eprintln!();

	eprintln!("{}", "supervision".cyan().bold());
	eprintln!("  {} <dir>              Child output log directory", "--log-dir".bold());
	eprintln!("  {} <secs>               SIGTERM-to-SIGKILL wait on stop", "--grace".bold());
	eprintln!("  {} <secs>           Uptime that resets the restart budget", "--stability".bold());
	eprintln!("  {}                    Do not mirror child output to the console", "-q, --quiet".bold());
	eprintln!();

	eprintln!("{}", "signals".cyan().bold());
	eprintln!("  SIGINT/SIGTERM             Stop the child gracefully and exit");
	eprintln!("  SIGHUP                     Re-resolve configuration and reload");
}
