//! Pessimistic lock storage.
//!
//! # Responsibility
//! - Acquire, inspect and release exclusive object locks in `orm_locks`.
//!
//! # Invariants
//! - At most one owner holds an object id (primary key on `objectid`).
//! - Acquiring a lock already held by the same owner returns the existing
//!   lock unchanged.
//! - Release is idempotent and only removes the caller's own rows.

use crate::concurrency::lock::{Lock, LockOwner, LockType};
use crate::error::{PersistenceError, PersistenceResult};
use crate::model::oid::ObjectId;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};

const LOCK_SELECT_SQL: &str = "SELECT objectid, login, sessionid, acquired_at FROM orm_locks";

pub struct LockManager<'conn> {
    conn: &'conn Connection,
}

impl<'conn> LockManager<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Acquires an exclusive lock on `oid` for `owner`.
    ///
    /// # Errors
    /// - `PessimisticLockConflict` when another owner holds the lock.
    pub fn acquire(&self, oid: &ObjectId, owner: &LockOwner) -> PersistenceResult<Lock> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO orm_locks (objectid, login, sessionid, acquired_at)
             VALUES (?1, ?2, ?3, (strftime('%s', 'now') * 1000));",
            params![oid.to_string(), owner.login, owner.session_id],
        )?;

        let lock = self.lock(oid)?.ok_or_else(|| {
            PersistenceError::InvalidData(format!("lock row of `{oid}` vanished after insert"))
        })?;
        if lock.owner != *owner {
            debug!(
                "event=lock_acquire module=concurrency status=conflict oid={oid} owner={}",
                lock.owner
            );
            return Err(PersistenceError::PessimisticLockConflict {
                oid: lock.oid,
                owner: lock.owner,
                acquired_at: lock.acquired_at,
            });
        }

        if inserted > 0 {
            info!("event=lock_acquire module=concurrency status=ok oid={oid} owner={owner}");
        }
        Ok(lock)
    }

    /// Releases `owner`'s lock on `oid`. Returns `false` when none was held.
    pub fn release(&self, oid: &ObjectId, owner: &LockOwner) -> PersistenceResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM orm_locks WHERE objectid = ?1 AND login = ?2 AND sessionid = ?3;",
            params![oid.to_string(), owner.login, owner.session_id],
        )?;
        if removed > 0 {
            info!("event=lock_release module=concurrency status=ok oid={oid} owner={owner}");
        }
        Ok(removed > 0)
    }

    /// Releases every lock of one session.
    pub fn release_all(&self, owner: &LockOwner) -> PersistenceResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM orm_locks WHERE login = ?1 AND sessionid = ?2;",
            params![owner.login, owner.session_id],
        )?;
        info!(
            "event=lock_release_all module=concurrency status=ok owner={owner} count={removed}"
        );
        Ok(removed)
    }

    /// Releases every lock of a login across sessions, e.g. on logout.
    pub fn release_by_login(&self, login: &str) -> PersistenceResult<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM orm_locks WHERE login = ?1;", params![login])?;
        info!(
            "event=lock_release_login module=concurrency status=ok login={login} count={removed}"
        );
        Ok(removed)
    }

    pub fn lock(&self, oid: &ObjectId) -> PersistenceResult<Option<Lock>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{LOCK_SELECT_SQL} WHERE objectid = ?1;"))?;
        let row = stmt
            .query_row(params![oid.to_string()], |row| Ok(parse_lock_row(row)))
            .optional()?;
        row.transpose()
    }

    /// Fails when someone other than `owner` holds a lock on `oid`.
    pub fn check_access(&self, oid: &ObjectId, owner: &LockOwner) -> PersistenceResult<()> {
        match self.lock(oid)? {
            Some(lock) if lock.owner != *owner => Err(PersistenceError::PessimisticLockConflict {
                oid: lock.oid,
                owner: lock.owner,
                acquired_at: lock.acquired_at,
            }),
            _ => Ok(()),
        }
    }

    /// All held locks, oldest first.
    pub fn list_locks(&self) -> PersistenceResult<Vec<Lock>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{LOCK_SELECT_SQL} ORDER BY acquired_at ASC, objectid ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut locks = Vec::new();
        while let Some(row) = rows.next()? {
            locks.push(parse_lock_row(row)?);
        }
        Ok(locks)
    }
}

fn parse_lock_row(row: &Row<'_>) -> PersistenceResult<Lock> {
    let raw_oid: String = row.get("objectid")?;
    let oid = ObjectId::parse(&raw_oid)
        .map_err(|err| PersistenceError::InvalidData(format!("lock row `{raw_oid}`: {err}")))?;
    Ok(Lock {
        oid,
        owner: LockOwner {
            login: row.get("login")?,
            session_id: row.get("sessionid")?,
        },
        lock_type: LockType::Pessimistic,
        acquired_at: row.get("acquired_at")?,
        snapshot: None,
    })
}

#[cfg(test)]
mod tests {
    use super::LockManager;
    use crate::concurrency::lock::LockOwner;
    use crate::db::open_db_in_memory;
    use crate::error::PersistenceError;
    use crate::model::oid::ObjectId;

    #[test]
    fn same_owner_reacquires_and_other_owner_conflicts() {
        let conn = open_db_in_memory().unwrap();
        let manager = LockManager::new(&conn);
        let oid = ObjectId::from_int("Page", 1).unwrap();
        let alice = LockOwner::new("alice", "s1");
        let bob = LockOwner::new("bob", "s9");

        let first = manager.acquire(&oid, &alice).unwrap();
        let again = manager.acquire(&oid, &alice).unwrap();
        assert_eq!(first, again);

        let conflict = manager.acquire(&oid, &bob).unwrap_err();
        assert!(matches!(
            conflict,
            PersistenceError::PessimisticLockConflict { ref owner, .. } if owner == &alice
        ));
        assert!(manager.check_access(&oid, &alice).is_ok());
        assert!(manager.check_access(&oid, &bob).is_err());
    }

    #[test]
    fn release_is_idempotent_and_scoped_to_owner() {
        let conn = open_db_in_memory().unwrap();
        let manager = LockManager::new(&conn);
        let oid = ObjectId::from_int("Page", 2).unwrap();
        let alice = LockOwner::new("alice", "s1");
        let bob = LockOwner::new("bob", "s2");

        manager.acquire(&oid, &alice).unwrap();
        assert!(!manager.release(&oid, &bob).unwrap());
        assert!(manager.release(&oid, &alice).unwrap());
        assert!(!manager.release(&oid, &alice).unwrap());
        assert!(manager.lock(&oid).unwrap().is_none());
    }

    #[test]
    fn release_by_login_spans_sessions() {
        let conn = open_db_in_memory().unwrap();
        let manager = LockManager::new(&conn);
        let first = ObjectId::from_int("Page", 3).unwrap();
        let second = ObjectId::from_int("Page", 4).unwrap();
        manager.acquire(&first, &LockOwner::new("carol", "a")).unwrap();
        manager.acquire(&second, &LockOwner::new("carol", "b")).unwrap();

        assert_eq!(manager.list_locks().unwrap().len(), 2);
        assert_eq!(manager.release_by_login("carol").unwrap(), 2);
        assert!(manager.list_locks().unwrap().is_empty());
    }
}
