use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Normal,
    /// Survives `remove`; only replaced through its unique tag.
    Persist,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<String>,
    pub level: EventLevel,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Options for [`EventLog::add`]; defaults to an untagged info record.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub unique: Option<String>,
    pub link: Option<String>,
    pub level: Option<EventLevel>,
    pub persist: bool,
}

impl NewEvent {
    pub fn unique(tag: impl Into<String>) -> Self {
        Self {
            unique: Some(tag.into()),
            ..Self::default()
        }
    }

    pub fn level(mut self, level: EventLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    records: VecDeque<EventRecord>,
}

/// Bounded log of user-visible status records, polled by id cursor.
#[derive(Debug)]
pub struct EventLog {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                records: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record and returns its id.
    ///
    /// A record sharing the unique tag of an earlier one takes its slot.
    pub fn add(&self, message: impl Into<String>, opts: NewEvent) -> u64 {
        let message = message.into();
        let level = opts.level.unwrap_or(EventLevel::Info);
        match level {
            EventLevel::Error => tracing::error!(unique = ?opts.unique, "{message}"),
            EventLevel::Warn => tracing::warn!(unique = ?opts.unique, "{message}"),
            EventLevel::Info => tracing::info!(unique = ?opts.unique, "{message}"),
            EventLevel::Debug => tracing::debug!(unique = ?opts.unique, "{message}"),
        }

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let record = EventRecord {
            id,
            unique: opts.unique,
            level,
            kind: if opts.persist {
                EventKind::Persist
            } else {
                EventKind::Normal
            },
            message,
            link: opts.link,
        };

        let existing = record.unique.as_ref().and_then(|tag| {
            inner
                .records
                .iter()
                .position(|r| r.unique.as_deref() == Some(tag.as_str()))
        });
        match existing {
            Some(pos) => inner.records[pos] = record,
            None => {
                inner.records.push_back(record);
                while inner.records.len() > self.capacity {
                    let victim = inner
                        .records
                        .iter()
                        .position(|r| r.kind == EventKind::Normal)
                        .unwrap_or(0);
                    inner.records.remove(victim);
                }
            }
        }
        id
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.add(message, NewEvent::default())
    }

    pub fn warn(&self, message: impl Into<String>) -> u64 {
        self.add(message, NewEvent::default().level(EventLevel::Warn))
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.add(message, NewEvent::default().level(EventLevel::Error))
    }

    /// Drops a normal record; persist records are left alone.
    pub fn remove(&self, id: u64) -> bool {
        let mut inner = self.lock();
        match inner.records.iter().position(|r| r.id == id) {
            Some(pos) if inner.records[pos].kind == EventKind::Normal => {
                inner.records.remove(pos);
                true
            }
            _ => false,
        }
    }

    /// Removes whatever record carries `tag`, persist or not.
    pub fn clear_unique(&self, tag: &str) {
        let mut inner = self.lock();
        inner.records.retain(|r| r.unique.as_deref() != Some(tag));
    }

    /// Records with an id greater than `since`, oldest slot first.
    pub fn since(&self, since: u64) -> Vec<EventRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.id > since)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<EventRecord> {
        self.since(0)
    }

    pub fn last_id(&self) -> u64 {
        self.lock().next_id - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_tag_replaces_in_place_with_new_id() {
        let log = EventLog::default();
        log.info("first");
        let a = log.add("old", NewEvent::unique("svc-1"));
        log.info("between");
        let b = log.add("new", NewEvent::unique("svc-1").level(EventLevel::Error));
        assert!(b > a);

        let tagged: Vec<_> = log
            .all()
            .into_iter()
            .filter(|r| r.unique.as_deref() == Some("svc-1"))
            .collect();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].message, "new");
        assert_eq!(tagged[0].id, b);
        assert_eq!(log.all()[1].id, b, "record keeps its slot");
    }

    #[test]
    fn persist_records_resist_remove() {
        let log = EventLog::default();
        let normal = log.info("normal");
        let sticky = log.add("sticky", NewEvent::default().persist());
        assert!(log.remove(normal));
        assert!(!log.remove(sticky));
        assert_eq!(log.all().len(), 1);
    }

    #[test]
    fn since_returns_newer_records_only() {
        let log = EventLog::default();
        let a = log.info("a");
        let b = log.warn("b");
        let c = log.error("c");
        let ids: Vec<u64> = log.since(a).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b, c]);
        assert!(log.since(c).is_empty());
        assert_eq!(log.last_id(), c);
    }

    #[test]
    fn capacity_evicts_oldest_normal_record() {
        let log = EventLog::with_capacity(2);
        let sticky = log.add("sticky", NewEvent::default().persist());
        log.info("one");
        let two = log.info("two");
        let ids: Vec<u64> = log.all().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![sticky, two]);
    }
}
