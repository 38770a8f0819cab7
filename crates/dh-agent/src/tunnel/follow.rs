//! Following a log file that may be truncated, rotated or recreated

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 8 * 1024;

/// Yields complete lines appended to a file, forever
///
/// The file is reopened from the start when it disappears and comes back,
/// when its inode changes, or when it shrinks below the read position.
/// A file truncated and rewritten past the old position between two polls
/// looks like an append; whoever truncates it must call [`reset`].
///
/// [`reset`]: LogFollower::reset
pub struct LogFollower {
    path: PathBuf,
    file: Option<File>,
    inode: Option<u64>,
    position: u64,
    pending: Vec<u8>,
    poll: Duration,
}

impl LogFollower {
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            path: path.into(),
            file: None,
            inode: None,
            position: 0,
            pending: Vec::new(),
            poll,
        }
    }

    /// Forget the open file and read from the start on the next poll
    pub fn reset(&mut self) {
        self.file = None;
        self.inode = None;
        self.position = 0;
        self.pending.clear();
    }

    /// Wait for the next complete line
    ///
    /// Dropping the future loses nothing: a read in flight completes into
    /// the file's own buffer and is returned by the next call.
    pub async fn next_line(&mut self) -> String {
        loop {
            if let Some(line) = self.take_line() {
                return line;
            }
            match self.read_more().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll).await,
                Err(e) => {
                    tracing::trace!("Waiting for {:?}: {}", self.path, e);
                    self.file = None;
                    tokio::time::sleep(self.poll).await;
                }
            }
        }
    }

    /// Lines written so far that were not returned yet, including an
    /// unterminated last line
    pub async fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            while let Some(line) = self.take_line() {
                lines.push(line);
            }
            match self.read_more().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::trace!("Cannot drain {:?}: {}", self.path, e);
                    break;
                }
            }
        }
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            lines.push(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string());
        }
        lines
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line[..end]);
        Some(text.trim_end_matches('\r').to_string())
    }

    async fn read_more(&mut self) -> io::Result<bool> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        let inode = inode_of(&metadata);

        let replaced = self.inode != Some(inode);
        let truncated = metadata.len() < self.position;
        if self.file.is_none() || replaced || truncated {
            if self.file.is_some() {
                tracing::debug!("{:?} was rotated or truncated, reopening", self.path);
            }
            self.file = Some(File::open(&self.path).await?);
            self.inode = Some(inode);
            self.position = 0;
            self.pending.clear();
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        let mut chunk = vec![0; READ_CHUNK];
        let read = file.read(&mut chunk).await?;
        if read == 0 {
            return Ok(false);
        }
        self.position += read as u64;
        self.pending.extend_from_slice(&chunk[..read]);
        Ok(true)
    }
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(_metadata: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(10);

    fn append(path: &std::path::Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn next(follower: &mut LogFollower) -> String {
        tokio::time::timeout(Duration::from_secs(5), follower.next_line())
            .await
            .expect("no line within timeout")
    }

    #[tokio::test]
    async fn test_follows_appended_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ngrok.log");
        append(&path, "first\nsec");

        let mut follower = LogFollower::new(&path, POLL);
        assert_eq!(next(&mut follower).await, "first");

        append(&path, "ond\r\nthird\n");
        assert_eq!(next(&mut follower).await, "second");
        assert_eq!(next(&mut follower).await, "third");
    }

    #[tokio::test]
    async fn test_waits_for_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ngrok.log");
        let mut follower = LogFollower::new(&path, POLL);

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            append(&writer_path, "hello\n");
        });
        assert_eq!(next(&mut follower).await, "hello");
    }

    #[tokio::test]
    async fn test_reopens_after_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ngrok.log");
        append(&path, "a fairly long line before restart\n");

        let mut follower = LogFollower::new(&path, POLL);
        assert_eq!(next(&mut follower).await, "a fairly long line before restart");

        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(next(&mut follower).await, "new");
    }

    #[tokio::test]
    async fn test_reset_rereads_regrown_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ngrok.log");
        append(&path, "old session line\n");

        let mut follower = LogFollower::new(&path, POLL);
        assert_eq!(next(&mut follower).await, "old session line");

        // Same inode, and longer than the old read position
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        append(&path, "Tunnel established at tcp://b:2\nnext line of new sess\n");

        follower.reset();
        assert_eq!(next(&mut follower).await, "Tunnel established at tcp://b:2");
        assert_eq!(next(&mut follower).await, "next line of new sess");
    }

    #[tokio::test]
    async fn test_drain_returns_unread_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ngrok.log");
        append(&path, "one\ntwo\nthree");

        let mut follower = LogFollower::new(&path, POLL);
        assert_eq!(next(&mut follower).await, "one");
        assert_eq!(follower.drain().await, ["two", "three"]);
        assert!(follower.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_reopens_after_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ngrok.log");
        append(&path, "old\n");

        let mut follower = LogFollower::new(&path, POLL);
        assert_eq!(next(&mut follower).await, "old");

        std::fs::rename(&path, dir.path().join("ngrok.log.1")).unwrap();
        append(&path, "rotated file with more content\n");
        assert_eq!(next(&mut follower).await, "rotated file with more content");
    }
}
