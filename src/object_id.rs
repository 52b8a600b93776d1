/// Object identifiers and object kinds
///
/// Every object ID is a fixed-width string: a leading `1`, a three digit type
/// code and a thirteen digit sequence number, e.g. `10010000000000042` is
/// question number 42. The type code is what lets the ledger resolve an
/// object's kind without a lookup.

use crate::error::{LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;

const ID_PREFIX: char = '1';
const TYPE_CODE_WIDTH: usize = 3;
const SEQUENCE_WIDTH: usize = 13;
const ID_LEN: usize = 1 + TYPE_CODE_WIDTH + SEQUENCE_WIDTH;

/// Every entity kind that receives an allocated ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Question,
    Answer,
    Comment,
    Tag,
    User,
    Activity,
}

impl EntityKind {
    pub fn code(self) -> u16 {
        match self {
            EntityKind::Question => 1,
            EntityKind::Answer => 2,
            EntityKind::Comment => 3,
            EntityKind::Tag => 4,
            EntityKind::User => 5,
            EntityKind::Activity => 6,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(EntityKind::Question),
            2 => Some(EntityKind::Answer),
            3 => Some(EntityKind::Comment),
            4 => Some(EntityKind::Tag),
            5 => Some(EntityKind::User),
            6 => Some(EntityKind::Activity),
            _ => None,
        }
    }
}

/// Kinds of object a ledger entry can point at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Question,
    Answer,
    Comment,
    Tag,
    User,
}

/// A counter column on an object's table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub table: &'static str,
    pub column: &'static str,
}

impl ObjectKind {
    /// Decode the kind embedded in an object ID
    pub fn from_object_id(object_id: &str) -> LedgerResult<Self> {
        let code = decode_type_code(object_id)
            .ok_or_else(|| LedgerError::NotFound(format!("Malformed object ID: {}", object_id)))?;

        match EntityKind::from_code(code) {
            Some(EntityKind::Question) => Ok(ObjectKind::Question),
            Some(EntityKind::Answer) => Ok(ObjectKind::Answer),
            Some(EntityKind::Comment) => Ok(ObjectKind::Comment),
            Some(EntityKind::Tag) => Ok(ObjectKind::Tag),
            Some(EntityKind::User) => Ok(ObjectKind::User),
            Some(EntityKind::Activity) | None => Err(LedgerError::NotFound(format!(
                "Unknown object type in ID: {}",
                object_id
            ))),
        }
    }

    /// Name used as the `{objectType}` part of activity configuration keys
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Question => "question",
            ObjectKind::Answer => "answer",
            ObjectKind::Comment => "comment",
            ObjectKind::Tag => "tag",
            ObjectKind::User => "user",
        }
    }

    pub fn entity(self) -> EntityKind {
        match self {
            ObjectKind::Question => EntityKind::Question,
            ObjectKind::Answer => EntityKind::Answer,
            ObjectKind::Comment => EntityKind::Comment,
            ObjectKind::Tag => EntityKind::Tag,
            ObjectKind::User => EntityKind::User,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            ObjectKind::Question => "question",
            ObjectKind::Answer => "answer",
            ObjectKind::Comment => "comment",
            ObjectKind::Tag => "tag",
            ObjectKind::User => "users",
        }
    }

    /// Configuration key for `action` on this kind, e.g. `answer.vote_up`
    pub fn activity_key(self, action: &str) -> String {
        format!("{}.{}", self.as_str(), action)
    }

    /// Whether votes on this kind are recorded in the ledger
    pub fn is_votable(self) -> bool {
        matches!(
            self,
            ObjectKind::Question | ObjectKind::Answer | ObjectKind::Comment
        )
    }

    pub fn vote_counter(self) -> Option<Counter> {
        if self.is_votable() {
            Some(Counter {
                table: self.table(),
                column: "vote_count",
            })
        } else {
            None
        }
    }

    pub fn follow_counter(self) -> Option<Counter> {
        match self {
            ObjectKind::Question | ObjectKind::Tag | ObjectKind::User => Some(Counter {
                table: self.table(),
                column: "follow_count",
            }),
            ObjectKind::Answer | ObjectKind::Comment => None,
        }
    }

    /// Look up the user who owns an object. A user owns itself; tags have no owner.
    pub async fn fetch_owner(
        self,
        conn: &mut SqliteConnection,
        object_id: &str,
    ) -> LedgerResult<Option<String>> {
        let sql = match self {
            ObjectKind::Question => "SELECT user_id FROM question WHERE id = ?1",
            ObjectKind::Answer => "SELECT user_id FROM answer WHERE id = ?1",
            ObjectKind::Comment => "SELECT user_id FROM comment WHERE id = ?1",
            ObjectKind::User => "SELECT id FROM users WHERE id = ?1",
            ObjectKind::Tag => {
                let exists: Option<String> = sqlx::query_scalar("SELECT id FROM tag WHERE id = ?1")
                    .bind(object_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                return match exists {
                    Some(_) => Ok(None),
                    None => Err(LedgerError::NotFound(format!("Tag {} not found", object_id))),
                };
            }
        };

        let owner: Option<String> = sqlx::query_scalar(sql)
            .bind(object_id)
            .fetch_optional(&mut *conn)
            .await?;

        owner.map(Some).ok_or_else(|| {
            LedgerError::NotFound(format!("{} {} not found", self.as_str(), object_id))
        })
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Counter {
    /// Add `delta` to the counter of one object
    pub async fn adjust(
        self,
        conn: &mut SqliteConnection,
        object_id: &str,
        delta: i64,
    ) -> LedgerResult<()> {
        if delta == 0 {
            return Ok(());
        }

        let sql = format!(
            "UPDATE {table} SET {column} = {column} + ?1 WHERE id = ?2",
            table = self.table,
            column = self.column
        );
        let result = sqlx::query(&sql)
            .bind(delta)
            .bind(object_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!(
                "Object {} not found in {}",
                object_id, self.table
            )));
        }

        Ok(())
    }
}

fn decode_type_code(object_id: &str) -> Option<u16> {
    if object_id.len() != ID_LEN
        || !object_id.starts_with(ID_PREFIX)
        || !object_id.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    object_id[1..1 + TYPE_CODE_WIDTH].parse().ok()
}

/// Format an allocated sequence number as an object ID
pub fn format_id(kind: EntityKind, sequence: i64) -> String {
    format!(
        "{}{:0tw$}{:0sw$}",
        ID_PREFIX,
        kind.code(),
        sequence,
        tw = TYPE_CODE_WIDTH,
        sw = SEQUENCE_WIDTH
    )
}

/// Allocate a new unique ID for `kind` inside the caller's transaction, so a
/// rolled back transaction also releases the allocation.
pub async fn gen_unique_id(conn: &mut SqliteConnection, kind: EntityKind) -> LedgerResult<String> {
    let sequence: i64 =
        sqlx::query_scalar("INSERT INTO uniqid (uniqid_type) VALUES (?1) RETURNING id")
            .bind(kind.code() as i64)
            .fetch_one(&mut *conn)
            .await?;

    Ok(format_id(kind, sequence))
}
