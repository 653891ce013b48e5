use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use helm_core::events::PersistenceEventType;
use helm_core::ids::{EventId, SessionId};
use helm_core::messages::Message;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::sessions::SessionRepo;

/// One record in the append-only conversation log.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: EventId,
    pub session_id: SessionId,
    pub parent_id: Option<EventId>,
    /// Strictly increasing per session; total append order.
    pub sequence: i64,
    /// Distance from the root along parent links.
    pub depth: i64,
    pub event_type: PersistenceEventType,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Payload of a `compact_boundary` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactBoundary {
    /// First event kept verbatim in future context. `None` keeps nothing.
    pub keep_from: Option<EventId>,
    /// Whether the prefix was hard-truncated instead of summarized.
    #[serde(default)]
    pub truncated: bool,
}

/// Payload of a `compact_summary` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactSummary {
    pub summary: String,
}

/// Per-session append locks. Appends read the current head and max
/// sequence before inserting, so they must be serialized per session.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    fn for_session(&self, id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Cloning shares the connection and the per-session append locks.
#[derive(Clone)]
pub struct EventRepo {
    db: Database,
    sessions: SessionRepo,
    locks: Arc<SessionLocks>,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            db,
            locks: Arc::new(SessionLocks::default()),
        }
    }

    /// Append an event to the session's active branch (parent = current
    /// head) and advance the head.
    pub fn append(
        &self,
        session_id: &SessionId,
        event_type: PersistenceEventType,
        payload: serde_json::Value,
    ) -> Result<EventRow, StoreError> {
        let lock = self.locks.for_session(session_id);
        let _guard = lock.lock();

        let session = self.sessions.get(session_id)?;
        self.insert(session_id, session.head_event_id.as_ref(), event_type, payload)
    }

    /// Append with an explicit parent, forking a new branch from any
    /// existing event. The new event becomes the active head.
    pub fn append_from(
        &self,
        session_id: &SessionId,
        parent: &EventId,
        event_type: PersistenceEventType,
        payload: serde_json::Value,
    ) -> Result<EventRow, StoreError> {
        let lock = self.locks.for_session(session_id);
        let _guard = lock.lock();

        // Parent must exist and belong to this session.
        let parent_row = self.get(parent)?;
        if parent_row.session_id != *session_id {
            return Err(StoreError::Conflict(format!(
                "event {parent} belongs to a different session"
            )));
        }
        self.insert(session_id, Some(parent), event_type, payload)
    }

    fn insert(
        &self,
        session_id: &SessionId,
        parent: Option<&EventId>,
        event_type: PersistenceEventType,
        payload: serde_json::Value,
    ) -> Result<EventRow, StoreError> {
        let id = EventId::new();
        let now = Utc::now().timestamp_millis();
        let payload_text = serde_json::to_string(&payload)?;

        let depth = match parent {
            Some(p) => self.get(p)?.depth + 1,
            None => 0,
        };

        self.db.with_conn(|conn| {
            let sequence: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO events (id, session_id, parent_id, sequence, depth, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_str(),
                    session_id.as_str(),
                    parent.map(|p| p.as_str()),
                    sequence,
                    depth,
                    event_type.to_string(),
                    payload_text,
                    now
                ],
            )?;
            Ok(())
        })?;

        // update_head keeps the first root value, so passing the new id is
        // only effective for the very first event.
        self.sessions.update_head(session_id, &id, &id)?;

        self.get(&id)
    }

    pub fn get(&self, id: &EventId) -> Result<EventRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, parent_id, sequence, depth, event_type, payload, created_at
                 FROM events WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_event(row),
                None => Err(StoreError::NotFound {
                    entity: "event",
                    id: id.to_string(),
                }),
            }
        })
    }

    /// All events for a session in append order (the full log, all branches).
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, parent_id, sequence, depth, event_type, payload, created_at
                 FROM events WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query(params![session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_event(row)?);
            }
            Ok(out)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// The active branch: root → head path, oldest first.
    pub fn active_branch(&self, session_id: &SessionId) -> Result<Vec<EventRow>, StoreError> {
        let session = self.sessions.get(session_id)?;
        let Some(head) = session.head_event_id else {
            return Ok(Vec::new());
        };

        let all = self.list(session_id)?;
        let by_id: HashMap<&str, &EventRow> =
            all.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut branch = Vec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let event = by_id.get(id.as_str()).ok_or_else(|| StoreError::CorruptRow {
                table: "events",
                column: "parent_id",
                detail: format!("dangling parent link to {id}"),
            })?;
            cursor = event.parent_id.clone();
            branch.push((*event).clone());
        }
        branch.reverse();
        Ok(branch)
    }

    /// Rebuild the active-branch message list as the model should see it.
    pub fn reconstruct_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Message>, StoreError> {
        let branch = self.active_branch(session_id)?;
        reconstruct_from_events(&branch)
    }
}

/// Replay a branch into context messages.
///
/// The last `compact_boundary` defines what the model sees: messages from
/// `keep_from` onward are kept verbatim, everything earlier is replaced by
/// the summary exchange from the matching `compact_summary` event (or
/// dropped entirely after a truncation fallback). The log itself keeps all
/// rows either way.
pub fn reconstruct_from_events(branch: &[EventRow]) -> Result<Vec<Message>, StoreError> {
    let boundary = branch
        .iter()
        .rev()
        .find(|e| e.event_type == PersistenceEventType::CompactBoundary);

    let (keep_from_seq, boundary_seq) = match boundary {
        Some(b) => {
            let payload: CompactBoundary =
                serde_json::from_value(b.payload.clone()).map_err(|e| StoreError::CorruptRow {
                    table: "events",
                    column: "payload",
                    detail: format!("compact_boundary: {e}"),
                })?;
            let keep_seq = match payload.keep_from {
                Some(ref keep_id) => branch
                    .iter()
                    .find(|e| e.id == *keep_id)
                    .map(|e| e.sequence)
                    .ok_or_else(|| StoreError::CorruptRow {
                        table: "events",
                        column: "payload",
                        detail: format!("keep_from {0} not on branch", keep_id),
                    })?,
                None => i64::MAX,
            };
            (keep_seq, b.sequence)
        }
        None => (i64::MIN, i64::MIN),
    };

    let mut messages = Vec::new();

    // Summary exchange substitutes for the compacted prefix.
    if let Some(summary_event) = branch
        .iter()
        .rev()
        .find(|e| e.event_type == PersistenceEventType::CompactSummary && e.sequence >= boundary_seq)
    {
        let payload: CompactSummary = serde_json::from_value(summary_event.payload.clone())
            .map_err(|e| StoreError::CorruptRow {
                table: "events",
                column: "payload",
                detail: format!("compact_summary: {e}"),
            })?;
        messages.push(Message::user_text(format!(
            "[Context from earlier in this conversation]\n\n{}",
            payload.summary
        )));
        messages.push(Message::assistant_text(
            "Understood. Continuing from that context.",
        ));
    }

    for event in branch {
        let is_message = matches!(
            event.event_type,
            PersistenceEventType::MessageUser
                | PersistenceEventType::MessageAssistant
                | PersistenceEventType::MessageToolResult
        );
        if !is_message {
            continue;
        }
        // Compacted prefix: present in the log, absent from context.
        if event.sequence < keep_from_seq && event.sequence < boundary_seq {
            continue;
        }
        let msg: Message =
            serde_json::from_value(event.payload.clone()).map_err(|e| StoreError::CorruptRow {
                table: "events",
                column: "payload",
                detail: format!("{}: {e}", event.event_type),
            })?;
        messages.push(msg);
    }

    Ok(messages)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    const T: &str = "events";
    let type_raw: String = row_helpers::get(row, T, "event_type")?;
    let payload_raw: String = row_helpers::get(row, T, "payload")?;
    Ok(EventRow {
        id: EventId::from_raw(row_helpers::get::<String>(row, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, T, "session_id")?),
        parent_id: row_helpers::get_opt::<String>(row, T, "parent_id")?.map(EventId::from_raw),
        sequence: row_helpers::get(row, T, "sequence")?,
        depth: row_helpers::get(row, T, "depth")?,
        event_type: row_helpers::parse_enum(&type_raw, T, "event_type")?,
        payload: row_helpers::parse_json(&payload_raw, T, "payload")?,
        created_at: row_helpers::get(row, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (EventRepo, SessionRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let session = sessions.create("test").unwrap();
        (EventRepo::new(db), sessions, session.id)
    }

    fn append_user(repo: &EventRepo, sid: &SessionId, text: &str) -> EventRow {
        repo.append(
            sid,
            PersistenceEventType::MessageUser,
            serde_json::to_value(Message::user_text(text)).unwrap(),
        )
        .unwrap()
    }

    fn append_assistant(repo: &EventRepo, sid: &SessionId, text: &str) -> EventRow {
        repo.append(
            sid,
            PersistenceEventType::MessageAssistant,
            serde_json::to_value(Message::assistant_text(text)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn append_chains_parents_and_advances_head() {
        let (repo, sessions, sid) = setup();
        let a = append_user(&repo, &sid, "one");
        let b = append_assistant(&repo, &sid, "two");

        assert_eq!(a.parent_id, None);
        assert_eq!(a.depth, 0);
        assert_eq!(b.parent_id, Some(a.id.clone()));
        assert_eq!(b.depth, 1);
        assert_eq!(b.sequence, a.sequence + 1);

        let session = sessions.get(&sid).unwrap();
        assert_eq!(session.head_event_id, Some(b.id));
        assert_eq!(session.root_event_id, Some(a.id));
    }

    #[test]
    fn replay_reconstructs_identical_branch() {
        let (repo, _, sid) = setup();
        append_user(&repo, &sid, "q1");
        append_assistant(&repo, &sid, "a1");
        append_user(&repo, &sid, "q2");

        let messages = repo.reconstruct_messages(&sid).unwrap();
        assert_eq!(
            messages,
            vec![
                Message::user_text("q1"),
                Message::assistant_text("a1"),
                Message::user_text("q2"),
            ]
        );
    }

    #[test]
    fn fork_creates_branch_without_mutating_original() {
        let (repo, _, sid) = setup();
        let a = append_user(&repo, &sid, "root");
        let _b = append_assistant(&repo, &sid, "original reply");

        // Fork from the root: new leaf, old events untouched.
        repo.append_from(
            &sid,
            &a.id,
            PersistenceEventType::MessageAssistant,
            serde_json::to_value(Message::assistant_text("alternate reply")).unwrap(),
        )
        .unwrap();

        assert_eq!(repo.count(&sid).unwrap(), 3);
        let messages = repo.reconstruct_messages(&sid).unwrap();
        assert_eq!(
            messages,
            vec![
                Message::user_text("root"),
                Message::assistant_text("alternate reply"),
            ]
        );
    }

    #[test]
    fn fork_rejects_foreign_parent() {
        let (repo, sessions, sid) = setup();
        append_user(&repo, &sid, "mine");

        let other = sessions.create("other").unwrap();
        let foreign = append_user(&repo, &other.id, "theirs");

        let err = repo
            .append_from(&sid, &foreign.id, PersistenceEventType::MessageUser, json!({}))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn compaction_replaces_prefix_in_context_only() {
        let (repo, _, sid) = setup();
        append_user(&repo, &sid, "old question");
        append_assistant(&repo, &sid, "old answer");
        let keep = append_user(&repo, &sid, "recent question");
        append_assistant(&repo, &sid, "recent answer");

        repo.append(
            &sid,
            PersistenceEventType::CompactBoundary,
            serde_json::to_value(CompactBoundary {
                keep_from: Some(keep.id.clone()),
                truncated: false,
            })
            .unwrap(),
        )
        .unwrap();
        repo.append(
            &sid,
            PersistenceEventType::CompactSummary,
            serde_json::to_value(CompactSummary { summary: "They talked about old things.".into() })
                .unwrap(),
        )
        .unwrap();

        let messages = repo.reconstruct_messages(&sid).unwrap();
        // summary pair + 2 kept messages
        assert_eq!(messages.len(), 4);
        assert!(matches!(&messages[0], Message::User(u)
            if matches!(&u.content[0], helm_core::messages::UserContent::Text { text } if text.contains("old things"))));
        assert_eq!(messages[2], Message::user_text("recent question"));
        assert_eq!(messages[3], Message::assistant_text("recent answer"));

        // Durable log still has every row.
        assert_eq!(repo.count(&sid).unwrap(), 6);
    }

    #[test]
    fn truncation_fallback_drops_prefix_without_summary() {
        let (repo, _, sid) = setup();
        append_user(&repo, &sid, "old");
        let keep = append_user(&repo, &sid, "kept");

        repo.append(
            &sid,
            PersistenceEventType::CompactBoundary,
            serde_json::to_value(CompactBoundary {
                keep_from: Some(keep.id.clone()),
                truncated: true,
            })
            .unwrap(),
        )
        .unwrap();

        let messages = repo.reconstruct_messages(&sid).unwrap();
        assert_eq!(messages, vec![Message::user_text("kept")]);
    }

    #[test]
    fn concurrent_appends_are_linearized() {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let sid = sessions.create("concurrent").unwrap().id;
        let repo = Arc::new(EventRepo::new(db));

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = Arc::clone(&repo);
            let sid = sid.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..5 {
                    repo.append(
                        &sid,
                        PersistenceEventType::MessageUser,
                        serde_json::to_value(Message::user_text(format!("{i}-{j}"))).unwrap(),
                    )
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let events = repo.list(&sid).unwrap();
        assert_eq!(events.len(), 40);
        // Sequences are 1..=40 with no gaps, and parent links form a chain.
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.sequence, i as i64 + 1);
            if i > 0 {
                assert_eq!(e.parent_id.as_ref(), Some(&events[i - 1].id));
            }
        }
        // The active branch is the whole chain.
        assert_eq!(repo.active_branch(&sid).unwrap().len(), 40);
    }
}
