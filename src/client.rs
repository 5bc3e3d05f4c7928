//! Proxy client façade.
//!
//! Owns the client configuration and lifecycle, and dials logical sessions
//! through a lazily created UDP underlay. The underlay closes itself when
//! its last session ends; the next dial binds a fresh socket.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{derive_key, BlockCipher, SecureRandom};
use crate::error::{Error, Result};
use crate::metrics::TransportMetrics;
use crate::replay::ReplayCache;
use crate::session::Session;
use crate::signal::Signal;
use crate::underlay::{UdpUnderlay, Underlay};

/// Default path MTU assumed for the tunnel.
pub const DEFAULT_MTU: usize = 1400;

/// Attempts to open a session before dial gives up.
const OPEN_RETRIES: u32 = 5;

/// How long each open attempt waits for the server's response.
const OPEN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Proxy server endpoint, host:port
    pub server_addr: String,
    /// Pre-shared credential: user name
    pub username: String,
    /// Pre-shared credential: password
    pub password: String,
    /// Path MTU
    pub mtu: usize,
}

impl ClientConfig {
    /// Create a configuration with the default MTU.
    pub fn new(
        server_addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            username: username.into(),
            password: password.into(),
            mtu: DEFAULT_MTU,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(Error::config("server_addr cannot be empty"));
        }
        if self.username.is_empty() {
            return Err(Error::config("username cannot be empty"));
        }
        if self.password.is_empty() {
            return Err(Error::config("password cannot be empty"));
        }
        if self.mtu == 0 {
            return Err(Error::config("mtu cannot be zero"));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Serialize, Deserialize)]
pub struct ClientConfigFile {
    /// Proxy server endpoint, host:port
    pub server_addr: String,
    /// User name
    pub username: String,
    /// Password (base64)
    pub password_b64: String,
    /// Path MTU
    pub mtu: usize,
}

impl ClientConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ClientConfig> {
        let password_bytes = STANDARD
            .decode(&self.password_b64)
            .map_err(|e| Error::config(format!("invalid base64 password: {e}")))?;
        let password = String::from_utf8(password_bytes)
            .map_err(|_| Error::config("password is not valid UTF-8"))?;

        let config = ClientConfig {
            server_addr: self.server_addr.clone(),
            username: self.username.clone(),
            password,
            mtu: self.mtu,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            server_addr: config.server_addr.clone(),
            username: config.username.clone(),
            password_b64: STANDARD.encode(config.password.as_bytes()),
            mtu: config.mtu,
        }
    }
}

#[derive(Default)]
struct ClientState {
    config: Option<ClientConfig>,
    running: bool,
    stopped: bool,
    underlay: Option<Arc<UdpUnderlay>>,
}

/// The proxy client.
pub struct Client {
    state: parking_lot::Mutex<ClientState>,
    /// Serializes underlay (re)creation across concurrent dials
    dial_lock: tokio::sync::Mutex<()>,
    replay: Arc<ReplayCache>,
    metrics: Arc<TransportMetrics>,
}

impl Client {
    /// Create a blank client with no configuration.
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(ClientState::default()),
            dial_lock: tokio::sync::Mutex::new(()),
            replay: Arc::new(ReplayCache::default()),
            metrics: Arc::new(TransportMetrics::new()),
        }
    }

    /// Return the stored client config.
    ///
    /// # Errors
    ///
    /// [`Error::NoClientConfig`] if no config was ever stored.
    pub fn load(&self) -> Result<ClientConfig> {
        self.state
            .lock()
            .config
            .clone()
            .ok_or(Error::NoClientConfig)
    }

    /// Save the client config.
    ///
    /// # Errors
    ///
    /// [`Error::StoreAfterStart`] once the client started;
    /// [`Error::Config`] if the config is invalid.
    pub fn store(&self, config: ClientConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.state.lock();
        if state.running {
            return Err(Error::StoreAfterStart);
        }
        state.config = Some(config);
        Ok(())
    }

    /// Activate the client with the stored configuration.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::invalid_op("client can't be restarted after stop"));
        }
        if state.config.is_none() {
            return Err(Error::NoClientConfig);
        }
        state.running = true;
        info!("shroud client started");
        Ok(())
    }

    /// Deactivate the client.
    ///
    /// Established sessions are not terminated: their underlay closes
    /// itself once the last session ends. The client can't be reused after
    /// stop.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = false;
        state.stopped = true;
        state.underlay = None;
        info!("shroud client stopped");
        Ok(())
    }

    /// Whether the client has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Transport counters for this client.
    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    /// Open a new logical session to the proxy server.
    ///
    /// # Errors
    ///
    /// [`Error::NotRunning`] unless the client is started;
    /// [`Error::Timeout`] when the server never answers the handshake.
    pub async fn dial(&self) -> Result<Arc<Session>> {
        let config = {
            let state = self.state.lock();
            if !state.running {
                return Err(Error::NotRunning);
            }
            state.config.clone().ok_or(Error::NoClientConfig)?
        };

        let underlay = self.ensure_underlay(&config).await?;
        self.open_session(underlay, config.mtu).await
    }

    /// Open a new logical session over a caller-provided underlay whose
    /// event loop is already running.
    pub async fn dial_with_underlay(&self, underlay: Arc<UdpUnderlay>) -> Result<Arc<Session>> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let mtu = underlay.mtu();
        self.open_session(underlay, mtu).await
    }

    async fn open_session(
        &self,
        underlay: Arc<UdpUnderlay>,
        mtu: usize,
    ) -> Result<Arc<Session>> {
        let session_id = loop {
            let id = SecureRandom::u32();
            if id != 0 {
                break id;
            }
        };
        let session = Session::new(session_id, true, mtu);
        Arc::clone(&underlay)
            .add_session(Arc::clone(&session))
            .await?;

        for attempt in 0..OPEN_RETRIES {
            session.open().await?;
            if tokio::time::timeout(OPEN_TIMEOUT, session.established())
                .await
                .is_ok()
            {
                debug!("session {} established", session_id);
                return Ok(session);
            }
            debug!(
                "session {} open attempt {} timed out",
                session_id,
                attempt + 1
            );
        }

        session.abort();
        session.wait().await;
        underlay.remove_session(session_id).await?;
        Err(Error::Timeout(
            (OPEN_TIMEOUT.as_millis() as u64) * OPEN_RETRIES as u64,
        ))
    }

    /// Reuse the live underlay or bind a fresh one.
    async fn ensure_underlay(&self, config: &ClientConfig) -> Result<Arc<UdpUnderlay>> {
        let _guard = self.dial_lock.lock().await;

        if let Some(underlay) = self.state.lock().underlay.clone() {
            if !underlay.is_closed() {
                return Ok(underlay);
            }
        }

        let block = BlockCipher::new(derive_key(&config.username, &config.password));
        let underlay = UdpUnderlay::new(
            "udp",
            None,
            &config.server_addr,
            config.mtu,
            block,
            Arc::clone(&self.replay),
            Arc::clone(&self.metrics),
        )
        .await?;

        let event_loop = Arc::clone(&underlay);
        tokio::spawn(async move {
            if let Err(e) = event_loop.run_event_loop(Signal::new()).await {
                debug!("client underlay event loop exited: {e}");
            }
        });

        self.state.lock().underlay = Some(Arc::clone(&underlay));
        Ok(underlay)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClientConfig {
        ClientConfig::new("127.0.0.1:48000", "alice", "hunter2")
    }

    #[test]
    fn test_load_without_store() {
        let client = Client::new();
        assert!(matches!(client.load(), Err(Error::NoClientConfig)));
    }

    #[test]
    fn test_store_and_load() {
        let client = Client::new();
        client.store(test_config()).unwrap();

        let loaded = client.load().unwrap();
        assert_eq!(loaded.server_addr, "127.0.0.1:48000");
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.mtu, DEFAULT_MTU);
    }

    #[test]
    fn test_store_rejects_invalid_config() {
        let client = Client::new();
        let mut config = test_config();
        config.username.clear();
        assert!(matches!(client.store(config), Err(Error::Config(_))));

        let mut config = test_config();
        config.mtu = 0;
        assert!(matches!(client.store(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_store_after_start() {
        let client = Client::new();
        client.store(test_config()).unwrap();
        client.start().unwrap();
        assert!(client.is_running());

        assert!(matches!(
            client.store(test_config()),
            Err(Error::StoreAfterStart)
        ));
    }

    #[test]
    fn test_start_without_config() {
        let client = Client::new();
        assert!(matches!(client.start(), Err(Error::NoClientConfig)));
    }

    #[test]
    fn test_lifecycle() {
        let client = Client::new();
        assert!(!client.is_running());

        client.store(test_config()).unwrap();
        client.start().unwrap();
        assert!(client.is_running());

        client.stop().unwrap();
        assert!(!client.is_running());

        // The client can't be reused after stop
        assert!(client.start().is_err());
    }

    #[tokio::test]
    async fn test_dial_not_running() {
        let client = Client::new();
        client.store(test_config()).unwrap();
        assert!(matches!(client.dial().await, Err(Error::NotRunning)));
    }

    #[test]
    fn test_config_file_roundtrip() {
        let config = test_config();
        let file = ClientConfigFile::from_config(&config);
        assert_ne!(file.password_b64, config.password);

        let restored = file.to_config().unwrap();
        assert_eq!(restored.server_addr, config.server_addr);
        assert_eq!(restored.username, config.username);
        assert_eq!(restored.password, config.password);
        assert_eq!(restored.mtu, config.mtu);
    }

    #[test]
    fn test_config_file_rejects_bad_base64() {
        let file = ClientConfigFile {
            server_addr: "127.0.0.1:48000".into(),
            username: "alice".into(),
            password_b64: "!!not-base64!!".into(),
            mtu: DEFAULT_MTU,
        };
        assert!(file.to_config().is_err());
    }
}
