//! Durable cache of last-known-good region URLs.
//!
//! Written whenever the set of connected region hosts changes and read back
//! as a discovery fallback when every configured URL fails. The rewrite is
//! write-temp-then-rename so concurrent readers never see a partial file.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub struct SavedPeerState {
    path: PathBuf,
    last: Mutex<Option<BTreeSet<String>>>,
}

impl SavedPeerState {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last: Mutex::new(None),
        }
    }

    /// Read the saved URLs, one per line. Missing or unreadable files are an
    /// empty list, not an error; the cache is strictly best-effort.
    pub fn load(&self) -> Vec<String> {
        match fs::read_to_string(&self.path) {
            Ok(data) => data
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Rewrite the file if `urls` differs from the last written set.
    /// Returns whether a write happened.
    pub fn update(&self, urls: &BTreeSet<String>) -> io::Result<bool> {
        let mut last = self.last.lock();
        if last.as_ref() == Some(urls) {
            return Ok(false);
        }
        let mut body = String::new();
        for url in urls {
            body.push_str(url);
            body.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        *last = Some(urls.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = SavedPeerState::new(dir.path().join("peers"));
        assert!(state.load().is_empty());
    }

    #[test]
    fn update_writes_once_per_change() {
        let dir = tempfile::tempdir().unwrap();
        let state = SavedPeerState::new(dir.path().join("peers"));
        let urls: BTreeSet<String> = ["http://10.0.0.1:5240/".to_string()].into();
        assert!(state.update(&urls).unwrap());
        assert!(!state.update(&urls).unwrap());
        assert_eq!(state.load(), vec!["http://10.0.0.1:5240/".to_string()]);

        let urls: BTreeSet<String> = [
            "http://10.0.0.1:5240/".to_string(),
            "http://10.0.0.2:5240/".to_string(),
        ]
        .into();
        assert!(state.update(&urls).unwrap());
        assert_eq!(state.load().len(), 2);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let state = SavedPeerState::new(dir.path().join("peers"));
        let urls: BTreeSet<String> = ["http://[::1]:5240/".to_string()].into();
        state.update(&urls).unwrap();
        assert!(!dir.path().join("peers.tmp").exists());
    }
}
