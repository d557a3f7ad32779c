//! World ↔ redb persistence.
//!
//! redb is a save file: loaded on boot, flushed after every mutation.
//! Never queried at runtime: World is the runtime truth.

use crate::auth::hash_password;
use crate::world::{Change, Table, World};
use chrono::Utc;
use redb::{Database, ReadableTable, StorageBackend, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, path::Path, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

type Blobs = TableDefinition<'static, &'static [u8], &'static [u8]>;

const TASKS: Blobs = TableDefinition::new("tasks");
const USERS: Blobs = TableDefinition::new("users");
const COMMENTS: Blobs = TableDefinition::new("comments");
const ATTACHMENTS: Blobs = TableDefinition::new("attachments");
const AUDIT_LOG: Blobs = TableDefinition::new("audit_log");

fn definition(table: Table) -> Blobs {
    match table {
        Table::Tasks => TASKS,
        Table::Users => USERS,
        Table::Comments => COMMENTS,
        Table::Attachments => ATTACHMENTS,
        Table::AuditLog => AUDIT_LOG,
    }
}

/// Thin handle to the redb file. Cloneable (Arc inside).
#[derive(Clone)]
pub struct SaveFile {
    db: Arc<Database>,
}

impl SaveFile {
    /// Open (or create) the save file at the given path.
    /// Creates tables if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SaveFileError> {
        Self::init(Database::create(path)?)
    }

    /// Same as `open`, over any redb storage backend.
    pub fn with_backend(backend: impl StorageBackend) -> Result<Self, SaveFileError> {
        Self::init(Database::builder().create_with_backend(backend)?)
    }

    fn init(db: Database) -> Result<Self, SaveFileError> {
        let txn = db.begin_write()?;
        {
            for table in [TASKS, USERS, COMMENTS, ATTACHMENTS, AUDIT_LOG] {
                let _ = txn.open_table(table)?;
            }
        }
        txn.commit()?;

        Ok(SaveFile { db: Arc::new(db) })
    }

    /// Load the entire World from disk. Called once at boot.
    pub fn load_world(&self) -> Result<World, SaveFileError> {
        let txn = self.db.begin_read()?;
        let mut world = World::new();

        world.tasks = load_table(&txn, TASKS, |t: &crate::models::Task| t.id)?;
        world.users = load_table(&txn, USERS, |u: &crate::models::User| u.id)?;
        world.comments = load_table(&txn, COMMENTS, |c: &crate::models::Comment| c.id)?;
        world.attachments = load_table(&txn, ATTACHMENTS, |a: &crate::models::Attachment| a.id)?;
        world.audit = load_table(&txn, AUDIT_LOG, |e: &crate::models::AuditEntry| e.id)?;

        Ok(world)
    }

    /// Write the given changes in one transaction. Rows are read from the
    /// current World, so several edits to one row collapse into one write.
    pub fn flush(&self, world: &World, changes: &[Change]) -> Result<(), SaveFileError> {
        if changes.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            for change in changes {
                match *change {
                    Change::Put(table, id) => {
                        let bytes = match table {
                            Table::Tasks => encode_row(world.tasks.get(&id))?,
                            Table::Users => encode_row(world.users.get(&id))?,
                            Table::Comments => encode_row(world.comments.get(&id))?,
                            Table::Attachments => encode_row(world.attachments.get(&id))?,
                            Table::AuditLog => encode_row(world.audit.get(&id))?,
                        };
                        let mut rows = txn.open_table(definition(table))?;
                        match bytes {
                            Some(bytes) => {
                                rows.insert(id.as_bytes().as_slice(), bytes.as_slice())?;
                            }
                            // Put then removed before the flush: nothing to keep.
                            None => {
                                rows.remove(id.as_bytes().as_slice())?;
                            }
                        }
                    }
                    Change::Remove(table, id) => {
                        let mut rows = txn.open_table(definition(table))?;
                        rows.remove(id.as_bytes().as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        tracing::debug!(rows = changes.len(), "flushed save file");
        Ok(())
    }

    /// Seed a default admin user if no users exist. Returns true if created.
    pub fn ensure_default_user(&self, world: &mut World) -> Result<bool, SaveFileError> {
        if !world.users.is_empty() {
            return Ok(false);
        }

        let password_hash =
            hash_password("admin").map_err(|e| SaveFileError::Encode(e.to_string()))?;

        let mut user = crate::models::User::new("admin", Some("👤".into()), Utc::now());
        user.password_hash = Some(password_hash);
        user.is_admin = true;

        world
            .insert_user(user)
            .map_err(|e| SaveFileError::Encode(e.to_string()))?;
        world.flush_with(|world, changes| self.flush(world, changes))?;
        Ok(true)
    }
}

fn load_table<T: DeserializeOwned>(
    txn: &redb::ReadTransaction,
    table: Blobs,
    key: impl Fn(&T) -> Uuid,
) -> Result<HashMap<Uuid, T>, SaveFileError> {
    let rows = txn.open_table(table)?;
    let mut out = HashMap::new();
    for entry in rows.iter()? {
        let (_, value) = entry?;
        let row: T = postcard::from_bytes(value.value())
            .map_err(|e| SaveFileError::Decode(e.to_string()))?;
        out.insert(key(&row), row);
    }
    Ok(out)
}

fn encode_row<T: Serialize>(row: Option<&T>) -> Result<Option<Vec<u8>>, SaveFileError> {
    row.map(|r| postcard::to_allocvec(r).map_err(|e| SaveFileError::Encode(e.to_string())))
        .transpose()
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SaveFileError {
    #[error("redb: {0}")]
    Redb(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
}

// redb 2.x has many error types. Blanket them all into SaveFileError::Redb.
macro_rules! from_redb {
    ($($t:ty),*) => {
        $(impl From<$t> for SaveFileError {
            fn from(e: $t) -> Self { SaveFileError::Redb(e.to_string()) }
        })*
    };
}

from_redb!(
    redb::Error,
    redb::DatabaseError,
    redb::TableError,
    redb::TransactionError,
    redb::StorageError,
    redb::CommitError
);

#[cfg(test)]
pub mod test_backend {
    use redb::backends::InMemoryBackend;
    use redb::StorageBackend;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// In-memory storage whose writes fail while the shared flag is set.
    #[derive(Debug)]
    pub struct FlakyDisk {
        inner: InMemoryBackend,
        failing: Arc<AtomicBool>,
    }

    impl FlakyDisk {
        pub fn new() -> (Self, Arc<AtomicBool>) {
            let failing = Arc::new(AtomicBool::new(false));
            let disk = FlakyDisk {
                inner: InMemoryBackend::new(),
                failing: failing.clone(),
            };
            (disk, failing)
        }

        fn check(&self) -> io::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(io::Error::other("disk unavailable"));
            }
            Ok(())
        }
    }

    impl StorageBackend for FlakyDisk {
        fn len(&self) -> Result<u64, io::Error> {
            self.inner.len()
        }

        fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, io::Error> {
            self.inner.read(offset, len)
        }

        fn set_len(&self, len: u64) -> Result<(), io::Error> {
            self.check()?;
            self.inner.set_len(len)
        }

        fn sync_data(&self, eventual: bool) -> Result<(), io::Error> {
            self.check()?;
            self.inner.sync_data(eventual)
        }

        fn write(&self, offset: u64, data: &[u8]) -> Result<(), io::Error> {
            self.check()?;
            self.inner.write(offset, data)
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Comment, Task, TaskStatus, User};
    use tempfile::TempDir;

    fn temp_save() -> (SaveFile, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sf = SaveFile::open(dir.path().join("tasks.redb")).unwrap();
        (sf, dir)
    }

    fn commit(sf: &SaveFile, world: &mut World) {
        let changes = world.take_pending();
        sf.flush(world, &changes).unwrap();
    }

    #[test]
    fn round_trip_empty_world() {
        let (sf, _dir) = temp_save();
        let world = sf.load_world().unwrap();
        assert!(world.tasks.is_empty());
        assert!(world.users.is_empty());
        assert!(world.audit.is_empty());
    }

    #[test]
    fn seed_and_reload() {
        let (sf, _dir) = temp_save();

        let mut world = sf.load_world().unwrap();
        assert!(sf.ensure_default_user(&mut world).unwrap());

        let mut world2 = sf.load_world().unwrap();
        assert_eq!(world2.users.len(), 1);
        let admin = world2.user_by_name("admin").unwrap();
        assert!(admin.is_admin);
        assert!(admin.password_hash.as_deref().unwrap().starts_with("$argon2"));

        assert!(!sf.ensure_default_user(&mut world2).unwrap());
    }

    #[test]
    fn flush_and_reload_tasks() {
        let (sf, _dir) = temp_save();
        let mut world = sf.load_world().unwrap();

        let owner = world.insert_user(User::new("Ada", None, Utc::now())).unwrap().id;
        let mut task = Task::new("Test task", Utc::now());
        task.owner_id = Some(owner);
        let task_id = world.insert_task(task).unwrap().id;
        commit(&sf, &mut world);

        world
            .modify_task(task_id, Utc::now(), |t| t.status = TaskStatus::Doing)
            .unwrap();
        commit(&sf, &mut world);

        let world2 = sf.load_world().unwrap();
        let task = &world2.tasks[&task_id];
        assert_eq!(task.title, "Test task");
        assert_eq!(task.status, TaskStatus::Doing);
        assert_eq!(task.owner_id, Some(owner));
    }

    #[test]
    fn delete_task_removes_cascade_from_disk() {
        let (sf, _dir) = temp_save();
        let mut world = sf.load_world().unwrap();

        let author = world.insert_user(User::new("Ada", None, Utc::now())).unwrap().id;
        let task_id = world.insert_task(Task::new("Doomed", Utc::now())).unwrap().id;
        world
            .insert_comment(Comment {
                id: Uuid::new_v4(),
                task_id,
                author_id: author,
                content: "soon gone".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        commit(&sf, &mut world);

        world.remove_task(task_id).unwrap();
        commit(&sf, &mut world);

        let world2 = sf.load_world().unwrap();
        assert!(world2.tasks.is_empty());
        assert!(world2.comments.is_empty());
        assert_eq!(world2.users.len(), 1);
    }

    #[test]
    fn failed_flush_keeps_memory_in_step_with_disk() {
        let (disk, failing) = test_backend::FlakyDisk::new();
        let sf = SaveFile::with_backend(disk).unwrap();
        let mut world = sf.load_world().unwrap();

        let kept = world.insert_task(Task::new("Kept", Utc::now())).unwrap().id;
        world.flush_with(|w, c| sf.flush(w, c)).unwrap();

        failing.store(true, std::sync::atomic::Ordering::SeqCst);
        world.insert_task(Task::new("Ghost", Utc::now())).unwrap();
        world
            .modify_task(kept, Utc::now(), |t| t.status = TaskStatus::Done)
            .unwrap();
        assert!(world.flush_with(|w, c| sf.flush(w, c)).is_err());

        assert_eq!(world.tasks.len(), 1);
        assert_eq!(world.tasks[&kept].status, TaskStatus::Todo);
    }

    #[test]
    fn put_then_remove_in_one_flush_leaves_nothing() {
        let (sf, _dir) = temp_save();
        let mut world = sf.load_world().unwrap();

        let id = world.insert_task(Task::new("Blink", Utc::now())).unwrap().id;
        world.remove_task(id).unwrap();
        commit(&sf, &mut world);

        assert!(sf.load_world().unwrap().tasks.is_empty());
    }
}
