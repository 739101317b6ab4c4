//! Message identity and on-disk naming.
//!
//! A queued message is a plain file whose name encodes `<id>_<unix_creation_ts>`;
//! the file body is the raw UTF-8 message text. Ids are 64-bit, start at 1 and
//! strictly increase for the lifetime of the gateway (across restarts, via the
//! persisted state).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Monotonic message id. Never reused; allocation goes through
/// [`crate::state::State::allocate_id`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub const FIRST: MessageId = MessageId(1);

    pub fn new(value: i64) -> Self {
        MessageId(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    /// The id handed out after this one.
    pub fn next(self) -> Self {
        MessageId(self.0 + 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message located in either the inbox or the sent directory.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    /// Unix seconds at enqueue time, taken from the file name.
    pub created: i64,
    pub path: PathBuf,
    pub file_name: String,
}

fn filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^([0-9]+)_([0-9]+)").unwrap())
}

impl Message {
    /// File name for a message enqueued now: `<id>_<unix_ts>`.
    pub fn file_name_for(id: MessageId, created: i64) -> String {
        format!("{}_{}", id, created)
    }

    /// Parse a message from its on-disk path. The name must start with
    /// `<digits>_<digits>`; in-flight `.tmp` files are rejected so a scan can
    /// never pick up a half-written message.
    pub fn from_path(path: &Path) -> Result<Message> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("not a valid message path: {}", path.display()))?
            .to_string();
        if file_name.ends_with(".tmp") {
            return Err(anyhow!("in-flight temporary file: {}", file_name));
        }
        let caps = filename_regex()
            .captures(&file_name)
            .ok_or_else(|| anyhow!("not a valid message filename: {}", file_name))?;
        let id: i64 = caps[1]
            .parse()
            .map_err(|_| anyhow!("not a valid message filename (id out of range): {}", file_name))?;
        let created: i64 = caps[2].parse().map_err(|_| {
            anyhow!(
                "not a valid message filename (timestamp out of range): {}",
                file_name
            )
        })?;
        Ok(Message {
            id: MessageId(id),
            created,
            path: path.to_path_buf(),
            file_name,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg id {}, created {}, file {}",
            self.id,
            self.created,
            self.path.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_ordering_and_next() {
        let a = MessageId::FIRST;
        let b = a.next();
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a, MessageId::new(1));
    }

    #[test]
    fn id_serde_is_transparent() {
        let id = MessageId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: MessageId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn filename_round_trip() {
        let name = Message::file_name_for(MessageId::new(17), 1700000000);
        assert_eq!(name, "17_1700000000");
        let msg = Message::from_path(Path::new("/data/messages/inbox/17_1700000000")).unwrap();
        assert_eq!(msg.id, MessageId::new(17));
        assert_eq!(msg.created, 1700000000);
        assert_eq!(msg.file_name, "17_1700000000");
    }

    #[test]
    fn filename_requires_leading_digits_pair() {
        assert!(Message::from_path(Path::new("/x/readme.txt")).is_err());
        assert!(Message::from_path(Path::new("/x/_12")).is_err());
        assert!(Message::from_path(Path::new("/x/12-34")).is_err());
        assert!(Message::from_path(Path::new("/x/12_")).is_err());
    }

    #[test]
    fn tmp_files_are_rejected() {
        assert!(Message::from_path(Path::new("/x/12_34.tmp")).is_err());
    }
}
