//! Durable message store.
//!
//! Messages live as flat files under `${dataDir}/messages/`: `inbox/` holds
//! pending messages, `sent/` the delivered history. Enqueueing writes
//! `<id>_<ts>.tmp` first and renames it into place — the rename is the commit
//! point, so a scan never observes a partial message. Delivery moves the file
//! into `sent/` with another rename; a message is never in both directories.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, trace, warn};

use crate::message::{Message, MessageId};
use crate::state::unix_now;

pub struct Storage {
    inbox_dir: PathBuf,
    sent_dir: PathBuf,
}

impl Storage {
    /// Create (if needed) the `messages/inbox` and `messages/sent` directories
    /// under `data_dir`.
    pub fn open(data_dir: &str) -> Result<Storage> {
        let messages = Path::new(data_dir).join("messages");
        let inbox_dir = messages.join("inbox");
        let sent_dir = messages.join("sent");
        for dir in [&inbox_dir, &sent_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory '{}'", dir.display()))?;
        }
        Ok(Storage {
            inbox_dir,
            sent_dir,
        })
    }

    /// Atomically store a message in the inbox, ready to be sent.
    pub fn enqueue(&self, id: MessageId, text: &str) -> Result<Message> {
        let created = unix_now();
        let file_name = Message::file_name_for(id, created);
        let final_path = self.inbox_dir.join(&file_name);
        let tmp_path = self.inbox_dir.join(format!("{}.tmp", file_name));

        debug!("Storing message {} to {}", id, tmp_path.display());
        fs::write(&tmp_path, text.as_bytes())
            .with_context(|| format!("failed to write file '{}'", tmp_path.display()))?;
        debug!(
            "Renaming {} => {}",
            tmp_path.display(),
            final_path.display()
        );
        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename file '{}' -> '{}'",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        Ok(Message {
            id,
            created,
            path: final_path,
            file_name,
        })
    }

    /// List the pending messages, ordered ascending by id. Files that do not
    /// parse as messages (`.tmp` leftovers, foreign files) are skipped with a
    /// warning.
    pub fn scan_inbox(&self) -> Result<Vec<Message>> {
        let entries = fs::read_dir(&self.inbox_dir).with_context(|| {
            format!(
                "failed to list files in inbox directory '{}'",
                self.inbox_dir.display()
            )
        })?;
        let mut messages = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            trace!("File in inbox: {}", path.display());
            match Message::from_path(&path) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Ignoring {} with malformed name: {}", path.display(), e),
            }
        }
        // delivered ids must be strictly increasing, so older messages go first
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    pub fn read_body(&self, msg: &Message) -> Result<Vec<u8>> {
        fs::read(&msg.path).with_context(|| format!("failed to read file '{}'", msg.path.display()))
    }

    /// Move a delivered message from `inbox/` to `sent/`.
    pub fn mark_sent(&self, msg: &Message) -> Result<()> {
        let target = self.sent_dir.join(&msg.file_name);
        fs::rename(&msg.path, &target).with_context(|| {
            format!(
                "failed to rename file '{}' -> '{}'",
                msg.path.display(),
                target.display()
            )
        })?;
        debug!("Moved file '{}' -> '{}'", msg.path.display(), target.display());
        Ok(())
    }

    pub fn delete(&self, msg: &Message) -> Result<()> {
        fs::remove_file(&msg.path)
            .with_context(|| format!("failed to delete file '{}'", msg.path.display()))
    }

    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }

    pub fn sent_dir(&self) -> &Path {
        &self.sent_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn enqueue_commits_via_rename() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_str().unwrap()).unwrap();
        let msg = storage.enqueue(MessageId::new(1), "hello").unwrap();

        let names = names_in(storage.inbox_dir());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("1_"));
        assert!(!names[0].ends_with(".tmp"));
        assert_eq!(storage.read_body(&msg).unwrap(), b"hello");
    }

    #[test]
    fn scan_skips_tmp_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_str().unwrap()).unwrap();
        storage.enqueue(MessageId::new(3), "three").unwrap();
        storage.enqueue(MessageId::new(1), "one").unwrap();
        fs::write(storage.inbox_dir().join("5_123.tmp"), "partial").unwrap();
        fs::write(storage.inbox_dir().join("notes.txt"), "junk").unwrap();

        let messages = storage.scan_inbox().unwrap();
        let ids: Vec<i64> = messages.iter().map(|m| m.id.value()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn mark_sent_moves_between_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_str().unwrap()).unwrap();
        let msg = storage.enqueue(MessageId::new(2), "body").unwrap();
        storage.mark_sent(&msg).unwrap();

        assert!(names_in(storage.inbox_dir()).is_empty());
        let sent = names_in(storage.sent_dir());
        assert_eq!(sent, vec![msg.file_name.clone()]);
    }

    #[test]
    fn delete_removes_inbox_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_str().unwrap()).unwrap();
        let msg = storage.enqueue(MessageId::new(4), "gone").unwrap();
        storage.delete(&msg).unwrap();
        assert!(names_in(storage.inbox_dir()).is_empty());
    }
}
