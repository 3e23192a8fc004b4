use std::path::{Path, PathBuf};

pub fn log_file_name(name: &str) -> String {
	format!("{}.log", name)
}

pub fn rotated_log_name(name: &str, stamp: u64) -> String {
	format!("{}-{}.log", name, stamp)
}

pub fn unix_now() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Removes the oldest rotated logs for `name`, keeping the newest
/// `keep` by modification time. The active log file is never touched.
pub fn prune_rotated(dir: &Path, name: &str, keep: usize) {
	let prefix = format!("{}-", name);
	let entries = match std::fs::read_dir(dir) {
		Ok(e) => e,
		Err(_) => return,
	};

	let mut rotated: Vec<PathBuf> = Vec::new();
	for entry in entries.flatten() {
		let path = entry.path();
		let file_name = match path.file_name().and_then(|n| n.to_str()) {
			Some(n) => n.to_string(),
			None => continue,
		};
		if file_name.starts_with(&prefix) && file_name.ends_with(".log") {
			rotated.push(path);
		}
	}

	if rotated.len() <= keep {
		return;
	}
	rotated.sort_by_key(|path| path.metadata().and_then(|m| m.modified()).ok());
	let excess = rotated.len() - keep;
	for path in rotated.iter().take(excess) {
		let _ = std::fs::remove_file(path);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_names() {
		assert_eq!(log_file_name("app"), "app.log");
		assert_eq!(rotated_log_name("app", 1754400000), "app-1754400000.log");
	}

	#[test]
	fn prune_keeps_newest() {
		let dir = std::env::temp_dir().join("chaperone-logs-prune-test");
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();

		for i in 0..5 {
			std::fs::write(dir.join(rotated_log_name("app", i)), "x").unwrap();
			// Distinct mtimes so ordering is deterministic.
			std::thread::sleep(std::time::Duration::from_millis(20));
		}
		std::fs::write(dir.join(log_file_name("app")), "active").unwrap();

		prune_rotated(&dir, "app", 2);

		let remaining: Vec<_> = std::fs::read_dir(&dir)
			.unwrap()
			.flatten()
			.map(|e| e.file_name().to_string_lossy().to_string())
			.collect();
		assert_eq!(remaining.len(), 3);
		assert!(remaining.contains(&"app.log".to_string()));
		assert!(remaining.contains(&"app-3.log".to_string()));
		assert!(remaining.contains(&"app-4.log".to_string()));

		let _ = std::fs::remove_dir_all(&dir);
	}
}
