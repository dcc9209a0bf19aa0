use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rand::thread_rng;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use santa_core::{Assignment, GroupStatus, ParticipantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type GroupId = i64;

/// Identity attached to a request after the boundary layer has authenticated
/// it. The coordinator trusts the flag and does no authentication of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    pub user_id: ParticipantId,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub invite_code: String,
    pub status: GroupStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSummary {
    pub status: GroupStatus,
    pub participant_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("group not found")]
    GroupNotFound,
    #[error("group already drawn")]
    AlreadyDrawn,
    #[error("caller is not a group admin")]
    Unauthorized,
    #[error("{0}")]
    InsufficientParticipants(#[from] santa_core::InsufficientParticipants),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// SQLite-backed store and draw coordinator for gift exchange groups.
pub struct Exchange {
    conn: Mutex<Connection>,
}

impl Exchange {
    pub fn open(path: &Path) -> Result<Self, ExchangeError> {
        let exchange = Self::from_connection(Connection::open(path)?)?;
        info!("exchange store opened at {}", path.display());
        Ok(exchange)
    }

    /// In-memory store for tests and throwaway tooling.
    pub fn open_in_memory() -> Result<Self, ExchangeError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ExchangeError> {
        // WAL keeps readers unblocked while a draw commits.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, ExchangeError>,
    ) -> Result<T, ExchangeError> {
        // A poisoned lock still holds a usable connection.
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, ExchangeError>,
    ) -> Result<T, ExchangeError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn create_group(&self) -> Result<Group, ExchangeError> {
        let invite_code = Uuid::new_v4().to_string();
        let group = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO groups (invite_code) VALUES (?1)",
                params![invite_code],
            )?;
            let id = conn.last_insert_rowid();
            query_group(conn, id)?.ok_or(ExchangeError::GroupNotFound)
        })?;
        info!("group {} created", group.id);
        Ok(group)
    }

    pub fn group_by_invite(&self, invite_code: &str) -> Result<Group, ExchangeError> {
        self.with_conn(|conn| {
            query_group_by_invite(conn, invite_code)?.ok_or(ExchangeError::GroupNotFound)
        })
    }

    /// Opts a user in to a group's draw. Joining twice is not an error, and
    /// a drawn group accepts no newcomers.
    pub fn join(
        &self,
        group_id: GroupId,
        user_id: ParticipantId,
    ) -> Result<JoinOutcome, ExchangeError> {
        let outcome = self.with_tx(|tx| {
            let status = query_status(tx, group_id)?.ok_or(ExchangeError::GroupNotFound)?;
            if status == GroupStatus::Drawn {
                return Err(ExchangeError::AlreadyDrawn);
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO participants (group_id, user_id) VALUES (?1, ?2)",
                params![group_id, user_id],
            )?;
            Ok(if inserted == 0 {
                JoinOutcome::AlreadyJoined
            } else {
                JoinOutcome::Joined
            })
        })?;
        debug!("join for user {user_id} on group {group_id}: {outcome:?}");
        Ok(outcome)
    }

    pub fn summary(&self, group_id: GroupId) -> Result<GroupSummary, ExchangeError> {
        self.with_conn(|conn| {
            let status = query_status(conn, group_id)?.ok_or(ExchangeError::GroupNotFound)?;
            let participant_count = query_participant_ids(conn, group_id)?.len();
            Ok(GroupSummary {
                status,
                participant_count,
            })
        })
    }

    pub fn participants(&self, group_id: GroupId) -> Result<Vec<ParticipantId>, ExchangeError> {
        self.with_conn(|conn| {
            query_status(conn, group_id)?.ok_or(ExchangeError::GroupNotFound)?;
            Ok(query_participant_ids(conn, group_id)?)
        })
    }

    /// Drops a participant from the group; any assignment rows naming them as
    /// giver or receiver go with them.
    pub fn remove_participant(
        &self,
        group_id: GroupId,
        user_id: ParticipantId,
    ) -> Result<bool, ExchangeError> {
        let removed = self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM participants WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )?;
            Ok(deleted > 0)
        })?;
        if removed {
            debug!("user {user_id} removed from group {group_id}");
        }
        Ok(removed)
    }

    pub fn delete_group(&self, group_id: GroupId) -> Result<bool, ExchangeError> {
        let removed = self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM groups WHERE id = ?1", [group_id])?;
            Ok(deleted > 0)
        })?;
        if removed {
            info!("group {group_id} deleted");
        }
        Ok(removed)
    }

    pub fn recipient_for(
        &self,
        group_id: GroupId,
        giver: ParticipantId,
    ) -> Result<Option<ParticipantId>, ExchangeError> {
        self.with_conn(|conn| {
            query_status(conn, group_id)?.ok_or(ExchangeError::GroupNotFound)?;
            Ok(query_recipient(conn, group_id, giver)?)
        })
    }

    pub fn assignments(&self, group_id: GroupId) -> Result<Vec<Assignment>, ExchangeError> {
        self.with_conn(|conn| {
            query_status(conn, group_id)?.ok_or(ExchangeError::GroupNotFound)?;
            Ok(query_assignments(conn, group_id)?)
        })
    }

    pub fn group_count(&self) -> Result<usize, ExchangeError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM groups", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Runs the one-time draw for a group.
    ///
    /// The pairs and the flip to drawn are committed in a single immediate
    /// transaction, and the flip is guarded on the status still being open.
    /// Of two racing draws exactly one commits; the other surfaces
    /// AlreadyDrawn and writes nothing.
    pub fn draw(&self, group_id: GroupId, caller: &Caller) -> Result<usize, ExchangeError> {
        if !caller.is_admin {
            warn!("draw on group {group_id} rejected for user {}", caller.user_id);
            return Err(ExchangeError::Unauthorized);
        }

        let committed = self.with_tx(|tx| {
            let status = query_status(tx, group_id)?.ok_or(ExchangeError::GroupNotFound)?;
            if status == GroupStatus::Drawn || query_has_assignments(tx, group_id)? {
                return Err(ExchangeError::AlreadyDrawn);
            }

            let participants = query_participant_ids(tx, group_id)?;
            let assignments = santa_core::draw_assignments(&participants, &mut thread_rng())?;

            commit_draw(tx, group_id, &assignments)?;
            Ok(assignments.len())
        })?;

        info!("group {group_id} drawn with {committed} assignments");
        Ok(committed)
    }
}

fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS groups (
            id           INTEGER PRIMARY KEY,
            invite_code  TEXT NOT NULL UNIQUE,
            status       TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'drawn')),
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS participants (
            group_id     INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            user_id      INTEGER NOT NULL,
            joined_at    TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (group_id, user_id)
        );

        -- Each participant gives once and receives once, never to themselves;
        -- deleting a participant deletes the rows that name them.
        CREATE TABLE IF NOT EXISTS assignments (
            group_id     INTEGER NOT NULL,
            giver_id     INTEGER NOT NULL,
            receiver_id  INTEGER NOT NULL,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (group_id, giver_id),
            UNIQUE (group_id, receiver_id),
            CHECK (giver_id <> receiver_id),
            FOREIGN KEY (group_id, giver_id)
                REFERENCES participants(group_id, user_id) ON DELETE CASCADE,
            FOREIGN KEY (group_id, receiver_id)
                REFERENCES participants(group_id, user_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id);
        ",
    )?;
    info!("schema migrations applied");
    Ok(())
}

/// Flips the group to drawn and inserts the batch. Must run inside a
/// transaction; a zero-row flip means another draw already won.
fn commit_draw(
    conn: &Connection,
    group_id: GroupId,
    assignments: &[Assignment],
) -> Result<(), ExchangeError> {
    let flipped = conn.execute(
        "UPDATE groups SET status = ?1 WHERE id = ?2 AND status = ?3",
        params![
            GroupStatus::Drawn.as_str(),
            group_id,
            GroupStatus::Open.as_str()
        ],
    )?;
    if flipped == 0 {
        return Err(ExchangeError::AlreadyDrawn);
    }

    let mut stmt = conn.prepare(
        "INSERT INTO assignments (group_id, giver_id, receiver_id) VALUES (?1, ?2, ?3)",
    )?;
    for assignment in assignments {
        stmt.execute(params![group_id, assignment.giver, assignment.receiver])?;
    }
    Ok(())
}

fn query_group(conn: &Connection, id: GroupId) -> rusqlite::Result<Option<Group>> {
    conn.query_row(
        "SELECT id, invite_code, status, created_at FROM groups WHERE id = ?1",
        [id],
        group_from_row,
    )
    .optional()
}

fn query_group_by_invite(conn: &Connection, invite_code: &str) -> rusqlite::Result<Option<Group>> {
    conn.query_row(
        "SELECT id, invite_code, status, created_at FROM groups WHERE invite_code = ?1",
        [invite_code],
        group_from_row,
    )
    .optional()
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let raw_status: String = row.get(2)?;
    Ok(Group {
        id: row.get(0)?,
        invite_code: row.get(1)?,
        status: parse_status(2, &raw_status)?,
        created_at: row.get(3)?,
    })
}

fn parse_status(column: usize, raw: &str) -> rusqlite::Result<GroupStatus> {
    GroupStatus::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("unknown group status: {raw}").into(),
        )
    })
}

fn query_status(conn: &Connection, group_id: GroupId) -> rusqlite::Result<Option<GroupStatus>> {
    conn.query_row("SELECT status FROM groups WHERE id = ?1", [group_id], |row| {
        let raw: String = row.get(0)?;
        parse_status(0, &raw)
    })
    .optional()
}

fn query_participant_ids(
    conn: &Connection,
    group_id: GroupId,
) -> rusqlite::Result<Vec<ParticipantId>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM participants WHERE group_id = ?1 ORDER BY joined_at, user_id",
    )?;
    let ids = stmt
        .query_map([group_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

fn query_has_assignments(conn: &Connection, group_id: GroupId) -> rusqlite::Result<bool> {
    let rows: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assignments WHERE group_id = ?1",
        [group_id],
        |row| row.get(0),
    )?;
    Ok(rows > 0)
}

fn query_assignments(conn: &Connection, group_id: GroupId) -> rusqlite::Result<Vec<Assignment>> {
    let mut stmt = conn.prepare(
        "SELECT giver_id, receiver_id FROM assignments WHERE group_id = ?1 ORDER BY giver_id",
    )?;
    let rows = stmt
        .query_map([group_id], |row| {
            Ok(Assignment {
                giver: row.get(0)?,
                receiver: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn query_recipient(
    conn: &Connection,
    group_id: GroupId,
    giver: ParticipantId,
) -> rusqlite::Result<Option<ParticipantId>> {
    conn.query_row(
        "SELECT receiver_id FROM assignments WHERE group_id = ?1 AND giver_id = ?2",
        params![group_id, giver],
        |row| row.get(0),
    )
    .optional()
}
