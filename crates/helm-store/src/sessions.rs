use chrono::Utc;
use rusqlite::params;

use helm_core::ids::{EventId, SessionId};
use helm_core::tokens::AccumulatedTokens;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Archived,
    Deleted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Session metadata row. The message tree itself lives in `events`.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: SessionId,
    pub title: String,
    pub status: SessionStatus,
    /// Active leaf of the message tree.
    pub head_event_id: Option<EventId>,
    pub root_event_id: Option<EventId>,
    pub usage: AccumulatedTokens,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, title: &str) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().timestamp_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, status, created_at, updated_at)
                 VALUES (?1, ?2, 'active', ?3, ?3)",
                params![id.as_str(), title, now],
            )?;
            Ok(())
        })?;
        self.get(&id)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, status, head_event_id, root_event_id,
                        total_input_tokens, total_output_tokens,
                        total_cache_read_tokens, total_cache_creation_tokens,
                        total_turns, created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound {
                    entity: "session",
                    id: id.to_string(),
                }),
            }
        })
    }

    pub fn list(
        &self,
        status: Option<SessionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut out = Vec::new();
            let sql = "SELECT id, title, status, head_event_id, root_event_id,
                              total_input_tokens, total_output_tokens,
                              total_cache_read_tokens, total_cache_creation_tokens,
                              total_turns, created_at, updated_at
                       FROM sessions
                       WHERE (?1 IS NULL OR status = ?1)
                       ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3";
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params![status.map(|s| s.as_str()), limit, offset])?;
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })
    }

    pub fn update_head(
        &self,
        id: &SessionId,
        head: &EventId,
        root: &EventId,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.update_row(id, |conn| {
            conn.execute(
                "UPDATE sessions
                 SET head_event_id = ?2,
                     root_event_id = COALESCE(root_event_id, ?3),
                     updated_at = ?4
                 WHERE id = ?1",
                params![id.as_str(), head.as_str(), root.as_str(), now],
            )
        })
    }

    /// Add one turn's usage to the session totals. Totals only ever grow.
    pub fn add_usage(
        &self,
        id: &SessionId,
        usage: &helm_core::tokens::TokenUsage,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.update_row(id, |conn| {
            conn.execute(
                "UPDATE sessions SET
                     total_input_tokens = total_input_tokens + ?2,
                     total_output_tokens = total_output_tokens + ?3,
                     total_cache_read_tokens = total_cache_read_tokens + ?4,
                     total_cache_creation_tokens = total_cache_creation_tokens + ?5,
                     total_turns = total_turns + 1,
                     updated_at = ?6
                 WHERE id = ?1",
                params![
                    id.as_str(),
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.cache_read_tokens,
                    usage.cache_creation_tokens,
                    now
                ],
            )
        })
    }

    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.update_row(id, |conn| {
            conn.execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), status.as_str(), now],
            )
        })
    }

    pub fn update_title(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.update_row(id, |conn| {
            conn.execute(
                "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), title, now],
            )
        })
    }

    fn update_row(
        &self,
        id: &SessionId,
        f: impl FnOnce(&rusqlite::Connection) -> Result<usize, rusqlite::Error>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = f(conn)?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "session",
                    id: id.to_string(),
                });
            }
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    const T: &str = "sessions";
    let status_raw: String = row_helpers::get(row, T, "status")?;
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, T, "id")?),
        title: row_helpers::get(row, T, "title")?,
        status: row_helpers::parse_enum(&status_raw, T, "status")?,
        head_event_id: row_helpers::get_opt::<String>(row, T, "head_event_id")?
            .map(EventId::from_raw),
        root_event_id: row_helpers::get_opt::<String>(row, T, "root_event_id")?
            .map(EventId::from_raw),
        usage: AccumulatedTokens {
            total_input: row_helpers::get::<i64>(row, T, "total_input_tokens")? as u64,
            total_output: row_helpers::get::<i64>(row, T, "total_output_tokens")? as u64,
            total_cache_read: row_helpers::get::<i64>(row, T, "total_cache_read_tokens")? as u64,
            total_cache_creation: row_helpers::get::<i64>(row, T, "total_cache_creation_tokens")?
                as u64,
            turns: row_helpers::get::<i64>(row, T, "total_turns")? as u64,
        },
        created_at: row_helpers::get(row, T, "created_at")?,
        updated_at: row_helpers::get(row, T, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::tokens::TokenUsage;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let session = repo.create("first").unwrap();
        assert_eq!(session.title, "first");
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.head_event_id.is_none());

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.id, session.id);
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = repo();
        let err = repo.get(&SessionId::from_raw("sess_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn usage_totals_accumulate() {
        let repo = repo();
        let session = repo.create("usage").unwrap();
        let usage = TokenUsage { input_tokens: 100, output_tokens: 20, ..Default::default() };
        repo.add_usage(&session.id, &usage).unwrap();
        repo.add_usage(&session.id, &usage).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.usage.total_input, 200);
        assert_eq!(fetched.usage.total_output, 40);
        assert_eq!(fetched.usage.turns, 2);
    }

    #[test]
    fn list_filters_by_status() {
        let repo = repo();
        let a = repo.create("a").unwrap();
        let _b = repo.create("b").unwrap();
        repo.update_status(&a.id, SessionStatus::Archived).unwrap();

        let active = repo.list(Some(SessionStatus::Active), 10, 0).unwrap();
        assert_eq!(active.len(), 1);
        let all = repo.list(None, 10, 0).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn head_update_sets_root_once() {
        let repo = repo();
        let session = repo.create("head").unwrap();
        let root = EventId::from_raw("evt_root");
        let leaf = EventId::from_raw("evt_leaf");
        repo.update_head(&session.id, &root, &root).unwrap();
        repo.update_head(&session.id, &leaf, &leaf).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.head_event_id, Some(leaf));
        // Root sticks to the first value.
        assert_eq!(fetched.root_event_id, Some(root));
    }
}
