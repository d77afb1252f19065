// src/credentials.rs
//! User credentials for the login and registration endpoints.
//!
//! The in-memory table is loaded once at startup from a [`CredentialStore`];
//! afterwards only registration writes to it, through a pooled store
//! handle, while holding the table lock.

use crate::error::{ServerError, ServerResult};
use crate::sync::{Mutex, Semaphore};
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Persistent backing for the credential table.
pub trait CredentialStore: Send {
    /// Every `(user, password)` pair currently stored.
    fn load_all(&mut self) -> ServerResult<Vec<(String, String)>>;
    fn insert(&mut self, user: &str, password: &str) -> ServerResult<()>;
}

/// One persisted account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Account {
    user: String,
    password: String,
}

/// JSON array of accounts, rewritten through a temp file and rename on
/// every insert.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open the account file at `path`, creating an empty one if missing.
    pub fn open(path: impl AsRef<Path>) -> ServerResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        if !store.path.exists() {
            store.persist(&[])?;
        }
        Ok(store)
    }

    fn store_err(&self, e: impl std::fmt::Display) -> ServerError {
        ServerError::Store(format!("{}: {e}", self.path.display()))
    }

    fn read_accounts(&self) -> ServerResult<Vec<Account>> {
        let file = File::open(&self.path).map_err(|e| self.store_err(e))?;
        if file.metadata().map_err(|e| self.store_err(e))?.len() == 0 {
            return Ok(Vec::new());
        }
        serde_json::from_reader(BufReader::new(file)).map_err(|e| self.store_err(e))
    }

    fn persist(&self, accounts: &[Account]) -> ServerResult<()> {
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let file = File::create(&temp).map_err(|e| self.store_err(e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, accounts).map_err(|e| self.store_err(e))?;
        writer.flush().map_err(|e| self.store_err(e))?;
        fs::rename(&temp, &self.path).map_err(|e| self.store_err(e))
    }
}

impl CredentialStore for FileStore {
    fn load_all(&mut self) -> ServerResult<Vec<(String, String)>> {
        let mut rows = Vec::new();
        for account in self.read_accounts()? {
            if account.user.is_empty() {
                warn!(path = %self.path.display(), "skipping account with empty name");
                continue;
            }
            rows.push((account.user, account.password));
        }
        Ok(rows)
    }

    fn insert(&mut self, user: &str, password: &str) -> ServerResult<()> {
        let mut accounts = self.read_accounts()?;
        accounts.push(Account {
            user: user.to_string(),
            password: password.to_string(),
        });
        self.persist(&accounts)
    }
}

/// Volatile store; clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<Vec<(String, String)>>>,
    read_only: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows<I, U, P>(rows: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let rows = rows.into_iter().map(|(u, p)| (u.into(), p.into())).collect();
        Self {
            rows: Arc::new(Mutex::new(rows)),
            read_only: false,
        }
    }

    /// A store whose inserts always fail.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn rows(&self) -> Vec<(String, String)> {
        self.rows.lock().clone()
    }
}

impl CredentialStore for MemoryStore {
    fn load_all(&mut self) -> ServerResult<Vec<(String, String)>> {
        Ok(self.rows.lock().clone())
    }

    fn insert(&mut self, user: &str, password: &str) -> ServerResult<()> {
        if self.read_only {
            return Err(ServerError::Store("store is read-only".into()));
        }
        self.rows.lock().push((user.to_string(), password.to_string()));
        Ok(())
    }
}

/// Fixed set of store handles shared by the workers.
pub struct StorePool {
    handles: Mutex<Vec<Box<dyn CredentialStore>>>,
    available: Semaphore,
}

impl StorePool {
    pub fn new(handles: Vec<Box<dyn CredentialStore>>) -> ServerResult<Self> {
        if handles.is_empty() {
            return Err(ServerError::Config("store pool needs at least one handle".into()));
        }
        let available = Semaphore::new(handles.len());
        Ok(Self {
            handles: Mutex::new(handles),
            available,
        })
    }

    /// `size` handles onto the same account file.
    pub fn file(path: impl AsRef<Path>, size: usize) -> ServerResult<Self> {
        let handles = (0..size)
            .map(|_| FileStore::open(path.as_ref()).map(|s| Box::new(s) as Box<dyn CredentialStore>))
            .collect::<ServerResult<Vec<_>>>()?;
        Self::new(handles)
    }

    /// `size` handles onto one shared [`MemoryStore`].
    pub fn memory(store: MemoryStore, size: usize) -> ServerResult<Self> {
        let handles = (0..size)
            .map(|_| Box::new(store.clone()) as Box<dyn CredentialStore>)
            .collect();
        Self::new(handles)
    }

    /// Block until a handle is free. It goes back to the pool when the
    /// guard drops.
    pub fn acquire(&self) -> ServerResult<PooledStore<'_>> {
        self.available.wait();
        match self.handles.lock().pop() {
            Some(handle) => Ok(PooledStore {
                pool: self,
                handle: Some(handle),
            }),
            None => {
                self.available.post();
                Err(ServerError::Store("store pool is empty".into()))
            }
        }
    }

    pub fn available(&self) -> usize {
        self.available.available()
    }
}

pub struct PooledStore<'a> {
    pool: &'a StorePool,
    handle: Option<Box<dyn CredentialStore>>,
}

impl PooledStore<'_> {
    pub fn load_all(&mut self) -> ServerResult<Vec<(String, String)>> {
        match self.handle.as_mut() {
            Some(handle) => handle.load_all(),
            None => Err(ServerError::Store("handle already released".into())),
        }
    }

    pub fn insert(&mut self, user: &str, password: &str) -> ServerResult<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.insert(user, password),
            None => Err(ServerError::Store("handle already released".into())),
        }
    }
}

impl Drop for PooledStore<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.handles.lock().push(handle);
            self.pool.available.post();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    NameTaken,
    StoreFailed,
}

pub struct CredentialTable {
    users: Mutex<HashMap<String, String>>,
}

impl CredentialTable {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Fill the table from one pooled handle.
    pub fn load(pool: &StorePool) -> ServerResult<Self> {
        let rows = pool.acquire()?.load_all()?;
        info!(accounts = rows.len(), "credential table loaded");
        Ok(Self {
            users: Mutex::new(rows.into_iter().collect()),
        })
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.lock().contains_key(user)
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.users.lock().get(user).is_some_and(|p| p == password)
    }

    /// Check-and-insert under the table lock, so two concurrent
    /// registrations of one name cannot both succeed.
    pub fn register(&self, pool: &StorePool, user: &str, password: &str) -> Registration {
        let mut users = self.users.lock();
        if users.contains_key(user) {
            return Registration::NameTaken;
        }
        let stored = pool.acquire().and_then(|mut store| store.insert(user, password));
        match stored {
            Ok(()) => {
                users.insert(user.to_string(), password.to_string());
                info!(user, "account registered");
                Registration::Created
            }
            Err(e) => {
                warn!(user, error = %e, "account registration failed");
                Registration::StoreFailed
            }
        }
    }
}

impl Default for CredentialTable {
    fn default() -> Self {
        Self::new()
    }
}
