//! Shared process state handed to the HTTP handlers.
//!
//! Holds the settings and the agent wake flag. Handlers never share a live
//! connection — every operation opens its own, and WAL plus the busy timeout
//! arbitrate with the agent thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rusqlite::Connection;

use crate::config::Settings;
use crate::db::{open_database, DatabaseError};

pub struct CoreState {
    settings: Settings,
    started_at: Instant,
    /// Set by the API to cut the agent's current sleep short.
    wake: Arc<AtomicBool>,
}

impl CoreState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            started_at: Instant::now(),
            wake: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Open a fresh connection to the application database.
    pub fn open_db(&self) -> Result<Connection, DatabaseError> {
        open_database(&self.settings.db_path)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// The flag shared with the agent thread's sleep loop.
    pub fn wake_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.wake)
    }

    /// Ask the agent to start its next cycle immediately.
    pub fn wake_agent(&self) {
        self.wake.store(true, Ordering::Relaxed);
    }
}
