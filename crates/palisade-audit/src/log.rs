//! The audit log: JSONL file sink plus a bounded in-memory query window.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::entry::AuditEntry;
use crate::error::AuditResult;

/// Default in-memory window size.
const DEFAULT_WINDOW: usize = 4096;

/// The append-only audit log.
///
/// Appends never block readers for long: the file write happens under the
/// same mutex as the ring update, but both are cheap. A missing file sink
/// (memory-only mode) is valid for tests.
pub struct AuditLog {
    inner: Mutex<Inner>,
}

struct Inner {
    window: VecDeque<AuditEntry>,
    capacity: usize,
    file: Option<File>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Open an audit log appending to `path`.
    ///
    /// The file is created 0600 if absent and only ever appended to.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for append.
    pub fn open(path: impl AsRef<Path>) -> AuditResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;

        tracing::info!(path = %path.display(), "Audit log opened");
        Ok(Self {
            inner: Mutex::new(Inner {
                window: VecDeque::with_capacity(256),
                capacity: DEFAULT_WINDOW,
                file: Some(file),
            }),
        })
    }

    /// Create a memory-only audit log (tests).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                window: VecDeque::with_capacity(256),
                capacity: DEFAULT_WINDOW,
                file: None,
            }),
        }
    }

    /// Append an entry.
    ///
    /// File write failures are logged and swallowed: a full disk must not
    /// take the bridge down, and the in-memory window still records the
    /// entry for operators.
    pub fn record(&self, entry: AuditEntry) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(file) = inner.file.as_mut() {
            match serde_json::to_string(&entry) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = file.write_all(line.as_bytes()) {
                        tracing::error!(error = %e, "Audit file append failed");
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "Audit entry serialization failed");
                },
            }
        }

        if inner.window.len() >= inner.capacity {
            inner.window.pop_front();
        }
        tracing::debug!(event_type = %entry.event_type, "Audit entry recorded");
        inner.window.push_back(entry);
    }

    /// The most recent entries with the given event type, newest first.
    #[must_use]
    pub fn recent(&self, event_type: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .window
            .iter()
            .rev()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Count of entries currently in the in-memory window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .window
            .len()
    }

    /// Whether the in-memory window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditAction, AuditOutcome};
    use palisade_core::CredentialId;

    fn denied(sender: &str) -> AuditEntry {
        AuditEntry::new(
            AuditAction::AccessDenied {
                sender: sender.to_owned(),
                room_id: "!r:ex".to_owned(),
                command: "status".to_owned(),
                reason: "sender not trusted".to_owned(),
            },
            AuditOutcome::ok(),
        )
    }

    #[test]
    fn test_record_and_query() {
        let log = AuditLog::in_memory();
        log.record(denied("@mallory:ex"));
        log.record(AuditEntry::new(
            AuditAction::CredentialStored {
                id: CredentialId::from("k1"),
            },
            AuditOutcome::ok(),
        ));

        assert_eq!(log.len(), 2);
        let denials = log.recent(Some("access_denied"), 10);
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].event_type, "access_denied");
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let log = AuditLog::in_memory();
        for i in 0..5 {
            log.record(denied(&format!("@user{i}:ex")));
        }
        let recent = log.recent(None, 2);
        assert_eq!(recent.len(), 2);
        match &recent[0].action {
            AuditAction::AccessDenied { sender, .. } => assert_eq!(sender, "@user4:ex"),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let log = AuditLog::open(&path).unwrap();
        log.record(denied("@mallory:ex"));
        log.record(denied("@eve:ex"));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let entry: AuditEntry = serde_json::from_str(line).unwrap();
            assert_eq!(entry.event_type, "access_denied");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_file_created_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let _log = AuditLog::open(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
