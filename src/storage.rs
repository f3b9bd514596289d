//! Persisted session store.
//!
//! Holds the one session a client process is signed in with, so that a later
//! run can pick it up as its "existing session". Backed by a Sled tree.

use sled::Db;

use crate::error::Result;
use crate::models::Session;

const SESSION_KEY: &[u8] = b"current";

#[derive(Clone)] // Sled handles are cheap to clone
pub struct SessionStore {
    #[allow(dead_code)] // kept so the tree's database outlives every clone
    db: Db,
    sessions: sled::Tree,
}

impl SessionStore {
    /// Open or create the store at the given path
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let sessions = db.open_tree("sessions")?;
        Ok(Self { db, sessions })
    }

    /// Throwaway in-memory store
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let sessions = db.open_tree("sessions")?;
        Ok(Self { db, sessions })
    }

    pub fn load(&self) -> Result<Option<Session>> {
        match self.sessions.get(SESSION_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let bytes = serde_json::to_vec(session)?;
        self.sessions.insert(SESSION_KEY, bytes)?;
        self.sessions.flush()?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.sessions.remove(SESSION_KEY)?;
        self.sessions.flush()?;
        Ok(())
    }
}
