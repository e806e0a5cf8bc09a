use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use strum_macros::Display;

/// Shown in place of a response the backend could not produce.
pub const FAILURE_NOTICE: &str = "Sorry, I encountered an error. Please try again.";

// ============================================================================
// Message Entries
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEntry {
    pub role: Role,
    pub content: String,
    pub status: EntryStatus,
}

impl MessageEntry {
    /// Complete and Failed entries never change again except via removal.
    pub fn is_final(&self) -> bool {
        matches!(self.status, EntryStatus::Complete | EntryStatus::Failed)
    }
}

/// Stable reference to one entry. Survives removal of *other* entries;
/// a handle to a removed entry is permanently stale and every operation
/// through it becomes a no-op.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntryHandle(u64);

// ============================================================================
// Change Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Appended(EntryHandle),
    Mutated(EntryHandle),
    Finalized(EntryHandle),
    Failed(EntryHandle),
    Removed(EntryHandle),
}

pub type Observer = Box<dyn Fn(Change) + Send + Sync>;

// ============================================================================
// Transcript Store
// ============================================================================

/// Ordered, append-only log of chat messages. The single source of truth
/// the view renders from; every mutation notifies subscribed observers so
/// the render layer can redraw.
///
/// Removal exists only for regenerate, which discards the most recent bot
/// entry before re-issuing the request.
pub struct Transcript {
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Observer>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<(u64, MessageEntry)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a render callback, invoked after every mutation.
    pub fn subscribe(&self, observer: impl Fn(Change) + Send + Sync + 'static) {
        lock(&self.observers).push(Box::new(observer));
    }

    fn notify(&self, change: Change) {
        for observer in lock(&self.observers).iter() {
            observer(change);
        }
    }

    pub fn append(&self, role: Role, content: impl Into<String>, status: EntryStatus) -> EntryHandle {
        let handle = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push((
                id,
                MessageEntry {
                    role,
                    content: content.into(),
                    status,
                },
            ));
            EntryHandle(id)
        };
        self.notify(Change::Appended(handle));
        handle
    }

    /// Append `fragment` to the referenced entry's content. A Pending entry
    /// moves to Streaming on its first fragment. Stale handles and already
    /// final entries are left untouched; that race is expected after
    /// regenerate or cancel and must not disturb the session.
    pub fn mutate(&self, handle: EntryHandle, fragment: &str) -> bool {
        let applied = {
            let mut inner = lock(&self.inner);
            match inner.entries.iter_mut().find(|(id, _)| *id == handle.0) {
                Some((_, entry)) if !entry.is_final() => {
                    entry.content.push_str(fragment);
                    entry.status = EntryStatus::Streaming;
                    true
                }
                Some(_) => {
                    log::debug!("mutate ignored: entry {:?} already finalized", handle);
                    false
                }
                None => {
                    log::debug!("mutate ignored: stale handle {:?}", handle);
                    false
                }
            }
        };
        if applied {
            self.notify(Change::Mutated(handle));
        }
        applied
    }

    /// Transition the entry to Complete. No-op on stale handles and on
    /// entries that already reached a final status.
    pub fn finalize(&self, handle: EntryHandle) -> bool {
        let applied = {
            let mut inner = lock(&self.inner);
            match inner.entries.iter_mut().find(|(id, _)| *id == handle.0) {
                Some((_, entry)) if !entry.is_final() => {
                    entry.status = EntryStatus::Complete;
                    true
                }
                _ => {
                    log::debug!("finalize ignored for handle {:?}", handle);
                    false
                }
            }
        };
        if applied {
            self.notify(Change::Finalized(handle));
        }
        applied
    }

    /// Transition the entry to Failed, surfacing `notice` to the user.
    /// Text that already streamed in stays visible; the notice lands on its
    /// own line after it. An entry that never received a fragment shows the
    /// notice alone.
    pub fn fail(&self, handle: EntryHandle, notice: &str) -> bool {
        let applied = {
            let mut inner = lock(&self.inner);
            match inner.entries.iter_mut().find(|(id, _)| *id == handle.0) {
                Some((_, entry)) if !entry.is_final() => {
                    if entry.content.is_empty() {
                        entry.content.push_str(notice);
                    } else {
                        entry.content.push('\n');
                        entry.content.push_str(notice);
                    }
                    entry.status = EntryStatus::Failed;
                    true
                }
                _ => {
                    log::debug!("fail ignored for handle {:?}", handle);
                    false
                }
            }
        };
        if applied {
            self.notify(Change::Failed(handle));
        }
        applied
    }

    /// Remove the most recent entry of `role`. Silent no-op when the
    /// transcript holds no such entry.
    pub fn remove_last(&self, role: Role) -> bool {
        let removed = {
            let mut inner = lock(&self.inner);
            match inner.entries.iter().rposition(|(_, e)| e.role == role) {
                Some(pos) => {
                    let (id, _) = inner.entries.remove(pos);
                    Some(EntryHandle(id))
                }
                None => None,
            }
        };
        match removed {
            Some(handle) => {
                self.notify(Change::Removed(handle));
                true
            }
            None => false,
        }
    }

    /// Current contents in insertion order. Each call observes the store's
    /// present state; callers re-read rather than holding on to old copies.
    pub fn snapshot(&self) -> Vec<MessageEntry> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn entry(&self, handle: EntryHandle) -> Option<MessageEntry> {
        lock(&self.inner)
            .entries
            .iter()
            .find(|(id, _)| *id == handle.0)
            .map(|(_, e)| e.clone())
    }

    /// Content of the most recent entry of `role`, used by regenerate to
    /// re-issue the prior user prompt.
    pub fn last_content(&self, role: Role) -> Option<String> {
        lock(&self.inner)
            .entries
            .iter()
            .rev()
            .find(|(_, e)| e.role == role)
            .map(|(_, e)| e.content.clone())
    }

    /// True while a response is in flight. At most one entry may be
    /// Pending or Streaming at any time; callers check this before
    /// starting a new submission.
    pub fn is_streaming(&self) -> bool {
        lock(&self.inner)
            .entries
            .iter()
            .any(|(_, e)| matches!(e.status, EntryStatus::Pending | EntryStatus::Streaming))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).entries.is_empty()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_append_and_mutate() {
        let transcript = Transcript::new();
        let user = transcript.append(Role::User, "hi", EntryStatus::Complete);
        let bot = transcript.append(Role::Bot, "", EntryStatus::Pending);

        assert!(transcript.mutate(bot, "Hel"));
        assert!(transcript.mutate(bot, "lo"));

        let entries = transcript.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].content, "Hello");
        assert_eq!(entries[1].status, EntryStatus::Streaming);
        assert_eq!(transcript.entry(user).unwrap().content, "hi");
    }

    #[test]
    fn test_mutate_after_finalize_is_noop() {
        let transcript = Transcript::new();
        let bot = transcript.append(Role::Bot, "", EntryStatus::Pending);
        transcript.mutate(bot, "done");
        assert!(transcript.finalize(bot));

        assert!(!transcript.mutate(bot, " extra"));
        assert_eq!(transcript.entry(bot).unwrap().content, "done");
        assert_eq!(transcript.entry(bot).unwrap().status, EntryStatus::Complete);
    }

    #[test]
    fn test_stale_handle_after_removal_is_noop() {
        let transcript = Transcript::new();
        transcript.append(Role::User, "hi", EntryStatus::Complete);
        let bot = transcript.append(Role::Bot, "partial", EntryStatus::Streaming);

        assert!(transcript.remove_last(Role::Bot));
        assert!(!transcript.mutate(bot, "late fragment"));
        assert!(!transcript.finalize(bot));
        assert!(!transcript.fail(bot, FAILURE_NOTICE));
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn test_remove_last_without_match_is_noop() {
        let transcript = Transcript::new();
        transcript.append(Role::User, "only user", EntryStatus::Complete);

        assert!(!transcript.remove_last(Role::Bot));
        let entries = transcript.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].role, Role::User);
    }

    #[test]
    fn test_fail_keeps_streamed_text() {
        let transcript = Transcript::new();
        let bot = transcript.append(Role::Bot, "", EntryStatus::Pending);
        transcript.mutate(bot, "partial answer");
        transcript.fail(bot, FAILURE_NOTICE);

        let entry = transcript.entry(bot).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(entry.content.starts_with("partial answer"));
        assert!(entry.content.ends_with(FAILURE_NOTICE));
    }

    #[test]
    fn test_fail_on_empty_entry_shows_notice_only() {
        let transcript = Transcript::new();
        let bot = transcript.append(Role::Bot, "", EntryStatus::Pending);
        transcript.fail(bot, FAILURE_NOTICE);
        assert_eq!(transcript.entry(bot).unwrap().content, FAILURE_NOTICE);
    }

    #[test]
    fn test_regenerate_scenario() {
        let transcript = Transcript::new();
        transcript.append(Role::User, "hi", EntryStatus::Complete);
        let old_bot = transcript.append(Role::Bot, "hello", EntryStatus::Complete);

        transcript.remove_last(Role::Bot);
        assert_eq!(transcript.snapshot().len(), 1);
        assert_eq!(transcript.last_content(Role::User).as_deref(), Some("hi"));

        let new_bot = transcript.append(Role::Bot, "", EntryStatus::Pending);
        transcript.mutate(new_bot, "hello again");
        transcript.finalize(new_bot);

        // The stale handle from before regenerate stays inert.
        assert!(!transcript.mutate(old_bot, "ghost"));

        let entries = transcript.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "hi");
        assert_eq!(entries[1].content, "hello again");
        assert_eq!(entries[1].status, EntryStatus::Complete);
    }

    #[test]
    fn test_streaming_flag() {
        let transcript = Transcript::new();
        assert!(!transcript.is_streaming());

        let bot = transcript.append(Role::Bot, "", EntryStatus::Pending);
        assert!(transcript.is_streaming());

        transcript.mutate(bot, "text");
        assert!(transcript.is_streaming());

        transcript.finalize(bot);
        assert!(!transcript.is_streaming());
    }

    #[test]
    fn test_observers_fire_on_every_mutation() {
        let transcript = Transcript::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        transcript.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let bot = transcript.append(Role::Bot, "", EntryStatus::Pending); // 1
        transcript.mutate(bot, "a"); // 2
        transcript.mutate(bot, "b"); // 3
        transcript.finalize(bot); // 4
        transcript.remove_last(Role::Bot); // 5
        transcript.mutate(bot, "stale"); // ignored, no notification

        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_snapshot_reflects_current_state() {
        let transcript = Transcript::new();
        let bot = transcript.append(Role::Bot, "", EntryStatus::Pending);
        let before = transcript.snapshot();
        transcript.mutate(bot, "grew");
        let after = transcript.snapshot();

        assert_eq!(before[0].content, "");
        assert_eq!(after[0].content, "grew");
    }
}
