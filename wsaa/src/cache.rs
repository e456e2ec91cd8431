// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Storage for issued tickets so they can be reused until they expire.
//!
//! Entries are keyed by service name. The stores never evict anything; an expired entry is
//! simply overwritten the next time a ticket is issued for that service.

use std::{
    collections::HashMap,
    future::Future,
    path::{Component, Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use crate::{error::CacheError, ticket::Ticket};

/// A place to keep issued tickets between issuances.
pub trait TicketStore: Send + Sync {
    /// Check that `service` can be stored before a ticket is requested for it.
    ///
    /// The default implementation accepts any name.
    fn check_key(&self, service: &str) -> Result<(), CacheError> {
        let _ = service;
        Ok(())
    }

    /// Load the ticket stored for `service`.
    ///
    /// Returns `Ok(None)` if there's no entry, or if the entry can't be understood.
    fn load(&self, service: &str) -> impl Future<Output = Result<Option<Ticket>, CacheError>> + Send;

    /// Store `ticket` for `service`, replacing any existing entry.
    fn store(
        &self,
        service: &str,
        ticket: &Ticket,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// Stores each ticket as a JSON file named `{service}ticket` in a directory.
///
/// Writes are atomic: the ticket is written to a temporary file in the same directory and
/// renamed over the old entry, so concurrent writers can't produce a partially written entry.
#[derive(Debug, Clone)]
pub struct FileTicketStore {
    directory: PathBuf,
}

impl FileTicketStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The path of the cache entry for `service`.
    ///
    /// # Errors
    ///
    /// The service name must be usable as a single file name component.
    pub fn path(&self, service: &str) -> Result<PathBuf, CacheError> {
        let mut components = Path::new(service).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !service.contains(['/', '\\']) => {
                Ok(self.directory.join(format!("{service}ticket")))
            }
            _ => Err(CacheError::InvalidKey(service.to_string())),
        }
    }
}

impl TicketStore for FileTicketStore {
    fn check_key(&self, service: &str) -> Result<(), CacheError> {
        self.path(service).map(|_| ())
    }

    async fn load(&self, service: &str) -> Result<Option<Ticket>, CacheError> {
        let path = self.path(service)?;
        let contents = tokio::task::spawn_blocking({
            let path = path.clone();
            move || std::fs::read_to_string(path)
        })
        .await
        .map_err(|error| CacheError::Task(error.to_string()))?;

        let contents = match contents {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No cached ticket");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(ticket) => Ok(Some(ticket)),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "Ignoring cached ticket that could not be parsed"
                );
                Ok(None)
            }
        }
    }

    async fn store(&self, service: &str, ticket: &Ticket) -> Result<(), CacheError> {
        let path = self.path(service)?;
        let directory = self.directory.clone();
        let contents = serde_json::to_vec(ticket)?;

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&directory)?;
            // NamedTempFile is created with 0600 permissions, and the ticket is a credential.
            let mut entry = tempfile::NamedTempFile::new_in(&directory)?;
            std::io::Write::write_all(&mut entry, &contents)?;
            entry.as_file().sync_all()?;
            entry.persist(&path).map_err(|error| error.error)?;
            tracing::debug!(path = %path.display(), "Cached ticket");
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|error| CacheError::Task(error.to_string()))??;

        Ok(())
    }
}

/// Keeps tickets in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryTicketStore {
    tickets: Mutex<HashMap<String, Ticket>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TicketStore for MemoryTicketStore {
    async fn load(&self, service: &str) -> Result<Option<Ticket>, CacheError> {
        let tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tickets.get(service).cloned())
    }

    async fn store(&self, service: &str, ticket: &Ticket) -> Result<(), CacheError> {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        tickets.insert(service.to_string(), ticket.clone());
        Ok(())
    }
}
