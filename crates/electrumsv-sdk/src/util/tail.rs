//! Log file follower

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

const POLL_DELAY: Duration = Duration::from_millis(300);

/// Follows a log file on a thread, echoing each new line to stdout
pub struct LogTail {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogTail {
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        Self::spawn_into(path, std::io::stdout())
    }

    /// Follow `path`, writing lines to `out`
    pub fn spawn_into<W>(path: impl Into<PathBuf>, out: W) -> Self
    where
        W: Write + Send + 'static,
    {
        let path = path.into();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || follow(path, flag, out));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Drain what is left in the file and join the thread
    pub fn finish(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn follow<W: Write>(path: PathBuf, stop: Arc<AtomicBool>, mut out: W) {
    let file = loop {
        match File::open(&path) {
            Ok(file) => break file,
            Err(_) if !stop.load(Ordering::SeqCst) => std::thread::sleep(POLL_DELAY),
            Err(e) => {
                warn!("Cannot follow {}: {}", path.display(), e);
                return;
            }
        }
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(POLL_DELAY);
            }
            Ok(_) => {
                if out.write_all(line.as_bytes()).is_err() {
                    break;
                }
                let _ = out.flush();
            }
            Err(e) => {
                warn!("Stopped following {}: {}", path.display(), e);
                break;
            }
        }
    }
}
