use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};
use reqwest::{StatusCode, Url};

use crate::{configuration_store::ConfigurationStore, Error, Result};

const CONFIG_ENDPOINT: &str = "/experiments/v1/config";

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    pub base_url: String,
    pub api_key: String,
    /// Interval to wait between requests for configuration.
    pub interval: Duration,
    /// Random extra wait added to `interval`, so that many instances do not poll in lockstep.
    pub jitter: Duration,
}

impl PollerThreadConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(30);

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> PollerThreadConfig {
        PollerThreadConfig {
            base_url: base_url.into(),
            api_key: api_key.into(),
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }

    fn url(&self) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}{}", self.base_url, CONFIG_ENDPOINT),
            &[
                ("apiKey", &*self.api_key),
                ("sdkName", env!("CARGO_PKG_NAME")),
                ("sdkVersion", env!("CARGO_PKG_VERSION")),
            ],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

/// A configuration poller thread.
///
/// Periodically fetches the experiment configuration document and stores it in a
/// [`ConfigurationStore`].
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::Sender<()>,

    /// Holds `None` if configuration hasn't been fetched yet. Holds `Some(Ok(()))` if configuration
    /// has been fetches successfully. Holds `Some(Err(...))` if there was an error fetching the
    /// first configuration.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    pub fn start(
        store: Arc<ConfigurationStore>,
        config: PollerThreadConfig,
    ) -> Result<PollerThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::channel::<()>();

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value| {
                if let Ok(mut slot) = result.0.lock() {
                    *slot = Some(value);
                }
                result.1.notify_all();
            };

            let url = config.url()?;
            let client = reqwest::blocking::Client::new();

            std::thread::Builder::new()
                .name("experiments-poller".to_owned())
                .spawn(move || {
                    loop {
                        log::debug!(target: "experiments", "fetching new configuration");
                        match client.get(url.clone()).send() {
                            Ok(response) => match response.status() {
                                StatusCode::OK => match response.json() {
                                    Ok(configuration) => {
                                        log::debug!(target: "experiments", "successfully fetched configuration");
                                        store.set_configuration(configuration);
                                        update_result(Ok(()));
                                    }
                                    Err(err) => {
                                        log::warn!(target: "experiments", "failed to parse configuration response body: {:?}", err);
                                    }
                                },
                                StatusCode::UNAUTHORIZED => {
                                    log::warn!(target: "experiments", "client is not authorized. Check your API key");
                                    update_result(Err(Error::Unauthorized));
                                    // Unauthorized means that API key is not valid and thus is not
                                    // recoverable. Stop the poller thread.
                                    return;
                                }
                                code => {
                                    // Ignore other errors, we'll try another request later.
                                    log::warn!(target: "experiments", "received non-200 response while fetching new configuration: {:?}", code);
                                }
                            },
                            Err(err) => {
                                log::warn!(target: "experiments", "error while fetching new configuration: {:?}", err)
                            }
                        };

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop to fetch new configuration.
                            }
                            Ok(()) => {
                                log::debug!(target: "experiments", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                // When the other end of channel disconnects, calls to
                                // .recv_timeout() return immediately. Use normal thread sleep in
                                // this case.
                                std::thread::sleep(timeout);
                            }
                        }
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block waiting for the first configuration to get fetched.
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => {
                    // The poller has already fetched the configuration. Return Ok(()) or a possible
                    // error.
                    return result.clone();
                }
                None => {
                    // Block waiting for configuration to get fetched.
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited). Ignoring it as there's nothing
        // useful we can do.
        let _ = self.stop_sender.send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        // Error means that the thread has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}
