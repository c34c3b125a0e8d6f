//! A background thread that periodically fetches the flag snapshot from the server.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{fetcher::ToggleFetcher, Error, Result};

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between fetches.
    pub interval: Duration,
    /// Upper bound of the random duration subtracted from each wait, so that many instances
    /// started together do not poll in lockstep.
    pub jitter: Duration,
}

/// A snapshot poller thread.
///
/// Failed fetches are logged and retried on the next tick; none of them stops the thread.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the first fetch completes, then the outcome of that first fetch.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    /// Start polling with `fetcher`. The first fetch happens immediately.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread could not be spawned.
    pub fn start(fetcher: ToggleFetcher, config: PollerThreadConfig) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync`. A buffer of 1 is enough: a
        // full buffer means a stop command is already pending.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value: Result<()>| {
                let mut slot = result.0.lock().unwrap_or_else(PoisonError::into_inner);
                // Only the first fetch outcome is reported.
                if slot.is_none() {
                    *slot = Some(value);
                    result.1.notify_all();
                }
            };

            std::thread::Builder::new()
                .name("flagsync-poller".to_owned())
                .spawn(move || {
                    let mut fetcher = fetcher;
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(err) => {
                                update_result(Err(Error::from(err)));
                                return;
                            }
                        };

                        loop {
                            match runtime.block_on(fetcher.fetch_toggles()) {
                                Ok(_) => update_result(Ok(())),
                                Err(err) => {
                                    log::warn!(target: "flagsync", "failed to fetch toggles: {err}");
                                    update_result(Err(err));
                                }
                            }

                            let timeout = jitter(config.interval, config.jitter);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {}
                                Ok(()) => {
                                    log::debug!(target: "flagsync", "poller thread received stop command");
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    log::debug!(target: "flagsync", "poller thread received disconnected");
                                    return;
                                }
                            }
                        }
                    }));

                    if outcome.is_err() {
                        update_result(Err(Error::ThreadPanicked));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block until the first fetch has completed and return its outcome.
    ///
    /// A failed first fetch is reported here, but the thread keeps polling.
    pub fn wait_for_configuration(&self) -> Result<()> {
        let (lock, condvar) = &*self.result;
        let mut slot = lock.lock().map_err(|_| Error::ThreadPanicked)?;
        loop {
            match &*slot {
                Some(result) => return result.clone(),
                None => {
                    slot = condvar.wait(slot).map_err(|_| Error::ThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread without waiting for it to exit.
    pub fn stop(&self) {
        // Either the thread is gone or a stop command is already queued. Nothing to do in both
        // cases.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle.join().map_err(|_| Error::ThreadPanicked)?;
        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(15);
        let jitter = Duration::from_secs(15);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let result = super::jitter(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let result = super::jitter(Duration::from_secs(15), Duration::ZERO);
        assert_eq!(result, Duration::from_secs(15));
    }
}
