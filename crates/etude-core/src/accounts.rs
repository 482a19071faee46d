// src/accounts.rs
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::db::ConnectionPool;
use crate::error::{EtudeError, EtudeResult};
use crate::sync::lock;

/// One row of the user table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user: String,
    /// Hex SHA-256 of `user:password`.
    pub digest: String,
}

pub fn password_digest(user: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

enum Backend {
    /// JSON lines, one [`UserRecord`] per line, appended on insert.
    File { path: PathBuf, append: File },
    Memory(Arc<Mutex<Vec<UserRecord>>>),
}

/// A handle onto the user table, handed out by the connection pool.
pub struct UserDbConnection {
    backend: Backend,
}

impl UserDbConnection {
    pub fn select_all(&mut self) -> EtudeResult<Vec<UserRecord>> {
        match &self.backend {
            Backend::Memory(rows) => Ok(lock(rows).clone()),
            Backend::File { path, .. } => {
                let file = File::open(path)
                    .map_err(|e| EtudeError::Database(format!("{}: {}", path.display(), e)))?;
                let mut rows = Vec::new();
                for (n, line) in BufReader::new(file).lines().enumerate() {
                    let line = line.map_err(|e| EtudeError::Database(e.to_string()))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<UserRecord>(&line) {
                        Ok(row) => rows.push(row),
                        Err(e) => warn!(line = n + 1, error = %e, "skipping corrupt user row"),
                    }
                }
                Ok(rows)
            }
        }
    }

    pub fn insert(&mut self, row: &UserRecord) -> EtudeResult<()> {
        match &mut self.backend {
            Backend::Memory(rows) => {
                lock(rows).push(row.clone());
                Ok(())
            }
            Backend::File { append, .. } => {
                let mut line =
                    serde_json::to_vec(row).map_err(|e| EtudeError::Database(e.to_string()))?;
                line.push(b'\n');
                // One write per row so concurrent appenders never interleave.
                append
                    .write_all(&line)
                    .map_err(|e| EtudeError::Database(e.to_string()))
            }
        }
    }
}

/// Opens pooled connections onto the user table.
pub struct UserDb;

impl UserDb {
    /// `None` keeps the table in memory for the life of the process.
    pub fn open_pool(
        path: Option<&Path>,
        connections: usize,
    ) -> EtudeResult<ConnectionPool<UserDbConnection>> {
        let shared = Arc::new(Mutex::new(Vec::new()));
        let mut conns = Vec::with_capacity(connections);
        for _ in 0..connections {
            let backend = match path {
                Some(path) => {
                    let append = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|e| {
                            EtudeError::Database(format!("{}: {}", path.display(), e))
                        })?;
                    Backend::File {
                        path: path.to_path_buf(),
                        append,
                    }
                }
                None => Backend::Memory(Arc::clone(&shared)),
            };
            conns.push(UserDbConnection { backend });
        }
        ConnectionPool::new(conns)
    }
}

/// User table cached in memory, written through the pool on registration.
pub struct Accounts {
    pool: ConnectionPool<UserDbConnection>,
    cache: Mutex<HashMap<String, String>>,
}

impl Accounts {
    pub fn open(path: Option<&Path>, connections: usize) -> EtudeResult<Self> {
        let pool = UserDb::open_pool(path, connections)?;
        let rows = pool.acquire()?.select_all()?;
        let cache: HashMap<_, _> = rows.into_iter().map(|r| (r.user, r.digest)).collect();
        info!(users = cache.len(), "user table loaded");
        Ok(Self {
            pool,
            cache: Mutex::new(cache),
        })
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        let digest = password_digest(user, password);
        lock(&self.cache).get(user) == Some(&digest)
    }

    /// `Ok(false)` when the name is empty or already taken.
    pub fn register(&self, user: &str, password: &str) -> EtudeResult<bool> {
        if user.is_empty() {
            return Ok(false);
        }
        let row = UserRecord {
            user: user.to_string(),
            digest: password_digest(user, password),
        };
        let mut conn = self.pool.acquire()?;
        let mut cache = lock(&self.cache);
        if cache.contains_key(user) {
            debug!(user, "registration refused, name taken");
            return Ok(false);
        }
        conn.insert(&row)?;
        cache.insert(row.user, row.digest);
        Ok(true)
    }

    pub fn users(&self) -> usize {
        lock(&self.cache).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let d = password_digest("alice", "secret");
        assert_eq!(d.len(), 64);
        assert_eq!(d, password_digest("alice", "secret"));
        assert_ne!(d, password_digest("alice", "Secret"));
    }

    #[test]
    fn register_then_verify_in_memory() {
        let accounts = Accounts::open(None, 2).unwrap();
        assert!(accounts.register("alice", "pw").unwrap());
        assert!(!accounts.register("alice", "other").unwrap());
        assert!(!accounts.register("", "pw").unwrap());
        assert!(accounts.verify("alice", "pw"));
        assert!(!accounts.verify("alice", "nope"));
        assert!(!accounts.verify("bob", "pw"));
    }

    #[test]
    fn file_table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.jsonl");
        {
            let accounts = Accounts::open(Some(&path), 3).unwrap();
            assert!(accounts.register("carol", "pw1").unwrap());
            assert!(accounts.register("dave", "pw2").unwrap());
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();

        let accounts = Accounts::open(Some(&path), 1).unwrap();
        assert_eq!(accounts.users(), 2);
        assert!(accounts.verify("dave", "pw2"));
    }
}
