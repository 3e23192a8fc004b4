use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::logs;

const RING_CAPACITY: usize = 64 * 1024;
const KEEP_ROTATED: usize = 5;

/// Captures one child's combined stdout/stderr.
///
/// Bytes land in an in-memory ring buffer (for status queries), an
/// appending log file with size-based rotation, and a broadcast channel
/// for live followers. Cheap to clone; clones share the same buffers.
#[derive(Clone)]
pub struct OutputLog {
	ring: Arc<Mutex<VecDeque<u8>>>,
	file: Arc<Mutex<LogFile>>,
	sender: broadcast::Sender<Vec<u8>>,
}

struct LogFile {
	handle: Option<File>,
	path: PathBuf,
	dir: PathBuf,
	name: String,
	written: u64,
	max_size: u64,
}

impl OutputLog {
	pub fn new(log_dir: &Path, name: &str, max_size: u64) -> Self {
		let _ = fs::create_dir_all(log_dir);
		let path = log_dir.join(logs::log_file_name(name));
		let handle = OpenOptions::new().create(true).append(true).open(&path).ok();
		let written = handle
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);

		let (sender, _) = broadcast::channel(256);

		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
			file: Arc::new(Mutex::new(LogFile {
				handle,
				path,
				dir: log_dir.to_path_buf(),
				name: name.to_string(),
				written,
				max_size,
			})),
			sender,
		}
	}

	pub async fn write(&self, data: &[u8]) {
		{
			let mut ring = self.ring.lock().await;
			for &byte in data {
				if ring.len() >= RING_CAPACITY {
					ring.pop_front();
				}
				ring.push_back(byte);
			}
		}
		{
			let mut file = self.file.lock().await;
			file.append(data);
		}
		let _ = self.sender.send(data.to_vec());
	}

	/// Current ring buffer contents.
	pub async fn snapshot(&self) -> Vec<u8> {
		let ring = self.ring.lock().await;
		ring.iter().copied().collect()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
		self.sender.subscribe()
	}

	pub async fn path(&self) -> PathBuf {
		self.file.lock().await.path.clone()
	}
}

impl LogFile {
	fn append(&mut self, data: &[u8]) {
		let Some(ref mut handle) = self.handle else { return };
		let _ = handle.write_all(data);
		self.written += data.len() as u64;
		if self.written >= self.max_size {
			self.rotate();
		}
	}

	fn rotate(&mut self) {
		self.handle = None;
		let rotated = self.dir.join(logs::rotated_log_name(&self.name, logs::unix_now()));
		let _ = fs::rename(&self.path, &rotated);
		logs::prune_rotated(&self.dir, &self.name, KEEP_ROTATED);
		self.handle = OpenOptions::new().create(true).append(true).open(&self.path).ok();
		self.written = 0;
	}
}
