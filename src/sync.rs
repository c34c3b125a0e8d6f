//! The per-client synchronization core.
//!
//! Every operation that replaces engine state (bootstrap, backup restore, poll, stream event) and
//! every streaming lifecycle transition goes through the single mutex held by [`SyncCore`]. Applies
//! therefore run strictly in arrival order and can never interleave with `start`/`stop`.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    backup::BackupStore, config::BackupPolicy, engine::Engine, streaming::EventSource,
    Error, Result, SdkContext,
};

/// Streaming pipeline state. Lives behind the [`SyncCore`] mutex together with the connection it
/// owns, so no transition can happen without holding the lock.
#[derive(Debug, Default)]
pub(crate) enum Lifecycle {
    #[default]
    Idle,
    Connecting,
    Running(EventSource),
    Stopped,
}

impl Lifecycle {
    /// Whether events from the connection with `generation` may still be applied.
    pub(crate) fn accepts(&self, generation: u64) -> bool {
        matches!(self, Lifecycle::Running(source) if source.generation() == generation)
    }
}

/// Where the state installed by [`SyncCore::initialize`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialSource {
    Bootstrap,
    Backup,
    /// Nothing usable. The engine starts empty and waits for the network.
    Empty,
}

/// Shared state of one client: the engine, the backup file and the lifecycle lock.
pub struct SyncCore {
    context: Arc<SdkContext>,
    engine: Arc<dyn Engine>,
    backup: BackupStore,
    lifecycle: Mutex<Lifecycle>,
}

impl SyncCore {
    pub fn new(context: Arc<SdkContext>, engine: Arc<dyn Engine>) -> SyncCore {
        let backup = BackupStore::new(context.config.resolved_backup_file());
        SyncCore {
            context,
            engine,
            backup,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn context(&self) -> &Arc<SdkContext> {
        &self.context
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn backup(&self) -> &BackupStore {
        &self.backup
    }

    /// Acquire the client lock. A panic while holding it leaves the state usable, so poisoning is
    /// ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the initial state: bootstrap first, then the backup file.
    ///
    /// The bootstrap configuration is consumed by the first call whether or not it could be used,
    /// so a later initialization never replays it. Nothing here is fatal.
    pub fn initialize(&self) -> InitialSource {
        let _guard = self.lock();

        if let Some(bootstrap) = self.context.take_bootstrap() {
            let applied = bootstrap
                .retrieve_toggles(self.context.config.request_timeout)
                .and_then(|raw| self.engine.take_state(&raw).map_err(Error::from));
            match applied {
                Ok(()) => {
                    log::debug!(target: "flagsync", "initialized from bootstrap");
                    return InitialSource::Bootstrap;
                }
                Err(err) => {
                    log::warn!(target: "flagsync", "unable to bootstrap, falling back to backup file: {err}");
                }
            }
        }

        let Some(raw) = self.backup.read() else {
            log::debug!(target: "flagsync", "no backup file, starting empty");
            return InitialSource::Empty;
        };

        match self.engine.take_state(&raw) {
            Ok(()) => {
                log::debug!(target: "flagsync", path:? = self.backup.path(); "initialized from backup file");
                InitialSource::Backup
            }
            Err(err) => {
                log::warn!(target: "flagsync", path:? = self.backup.path();
                           "ignoring unusable backup file: {err}");
                InitialSource::Empty
            }
        }
    }

    /// Apply a polled snapshot, then persist it. A payload the engine rejects is not persisted.
    pub(crate) fn apply_fetched(&self, raw: &str) -> Result<()> {
        let _guard = self.lock();
        self.engine.take_state(raw)?;
        self.backup.save(raw);
        Ok(())
    }

    /// Persist and apply a streamed payload according to the configured [`BackupPolicy`].
    ///
    /// Streamed payloads may be incremental, so once one is applied the backup is overwritten with
    /// the engine's full state. A restart from the backup then sees every flag, not only the ones
    /// in the last event.
    ///
    /// The caller must hold the lock returned by [`SyncCore::lock`].
    pub(crate) fn apply_streamed(&self, _guard: &MutexGuard<'_, Lifecycle>, raw: &str) -> Result<()> {
        if self.context.config.backup_policy == BackupPolicy::PersistSeen {
            self.backup.save(raw);
        }
        self.engine.take_state(raw)?;

        match self.engine.get_state() {
            Ok(state) => {
                self.backup.save(&state);
            }
            Err(err) => {
                log::warn!(target: "flagsync", "unable to export engine state for backup: {err}");
            }
        }
        Ok(())
    }
}
