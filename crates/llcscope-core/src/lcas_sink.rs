//! The LCAS output channel: a rank-keyed map of socket ids that external
//! schedulers consume read-only.
//!
//! Rank 0 is the coldest socket. The sentinel value `n_sockets` at rank 0
//! means "no preference". The default sink renders the map as one
//! `rank socket` line per entry in a text file; deployments with a
//! different consumer plug in their own sink.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Consumer-facing publication of the socket order.
pub trait LcasSink: Send + Sync {
    /// Publish a coldest-first socket order; `order[rank] = socket`.
    fn publish(&self, order: &[u32]);

    /// Publish the no-preference sentinel (`n_sockets` at rank 0).
    fn no_preference(&self, n_sockets: u32);
}

/// File-backed map, one `rank socket` pair per line.
pub struct FileLcasSink {
    path: PathBuf,
}

impl FileLcasSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn write_entries(&self, entries: &[(u32, u32)]) {
        let render = |entries: &[(u32, u32)]| -> std::io::Result<()> {
            let mut f = std::fs::File::create(&self.path)?;
            for (rank, socket) in entries {
                writeln!(f, "{rank} {socket}")?;
            }
            Ok(())
        };
        if let Err(e) = render(entries) {
            log::warn!("failed to write LCAS map {}: {e}", self.path.display());
        }
    }
}

impl LcasSink for FileLcasSink {
    fn publish(&self, order: &[u32]) {
        let entries: Vec<(u32, u32)> = order
            .iter()
            .enumerate()
            .map(|(rank, &socket)| (rank as u32, socket))
            .collect();
        self.write_entries(&entries);
    }

    fn no_preference(&self, n_sockets: u32) {
        self.write_entries(&[(0, n_sockets)]);
    }
}

/// In-memory sink recording every publication; for tests and dry runs.
#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<Vec<u32>>>,
    pub no_prefs: Mutex<u32>,
}

impl LcasSink for RecordingSink {
    fn publish(&self, order: &[u32]) {
        self.published.lock().unwrap().push(order.to_vec());
    }

    fn no_preference(&self, _n_sockets: u32) {
        *self.no_prefs.lock().unwrap() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_writes_rank_socket_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lcas_map");
        let sink = FileLcasSink::new(&path);

        sink.publish(&[2, 0, 1]);
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "0 2\n1 0\n2 1\n");
    }

    #[test]
    fn file_sink_no_preference_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lcas_map");
        let sink = FileLcasSink::new(&path);

        sink.no_preference(4);
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "0 4\n");
    }

    #[test]
    fn recording_sink_accumulates() {
        let sink = RecordingSink::default();
        sink.publish(&[1, 0]);
        sink.no_preference(2);
        sink.publish(&[0, 1]);
        assert_eq!(sink.published.lock().unwrap().len(), 2);
        assert_eq!(*sink.no_prefs.lock().unwrap(), 1);
    }
}
