use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use uuid::Uuid;

use super::repository::{self, ConsultationPatch};
use super::sqlite::{open_database, open_memory_database};
use super::DatabaseError;
use crate::models::{Consultation, ConsultationStatus, TaskReference};

/// Durable home of consultation records.
///
/// Every status change goes through [`RecordStore::update`], which only applies
/// when the row is still in one of the expected states. Callers treat a `false`
/// return as "someone else moved this record" and back off.
pub trait RecordStore: Send + Sync {
    fn insert(&self, consultation: &Consultation) -> Result<(), DatabaseError>;

    fn get(&self, id: &Uuid) -> Result<Option<Consultation>, DatabaseError>;

    fn update(
        &self,
        id: &Uuid,
        expected: &[ConsultationStatus],
        patch: &ConsultationPatch,
    ) -> Result<bool, DatabaseError>;

    fn claim_task(&self, id: &Uuid, reference: &TaskReference) -> Result<bool, DatabaseError>;

    fn set_confirmed_codes(&self, id: &Uuid, codes: &[String]) -> Result<(), DatabaseError>;

    fn delete(&self, id: &Uuid) -> Result<bool, DatabaseError>;
}

/// SQLite-backed record store. One connection, serialized behind a mutex.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_database(path)?))
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_memory_database()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, consultation: &Consultation) -> Result<(), DatabaseError> {
        repository::insert_consultation(&*self.conn()?, consultation)
    }

    fn get(&self, id: &Uuid) -> Result<Option<Consultation>, DatabaseError> {
        repository::get_consultation(&*self.conn()?, id)
    }

    fn update(
        &self,
        id: &Uuid,
        expected: &[ConsultationStatus],
        patch: &ConsultationPatch,
    ) -> Result<bool, DatabaseError> {
        repository::update_consultation(&*self.conn()?, id, expected, patch)
    }

    fn claim_task(&self, id: &Uuid, reference: &TaskReference) -> Result<bool, DatabaseError> {
        repository::claim_task_reference(&*self.conn()?, id, reference)
    }

    fn set_confirmed_codes(&self, id: &Uuid, codes: &[String]) -> Result<(), DatabaseError> {
        repository::set_confirmed_codes(&*self.conn()?, id, codes)
    }

    fn delete(&self, id: &Uuid) -> Result<bool, DatabaseError> {
        repository::delete_consultation(&*self.conn()?, id)
    }
}
