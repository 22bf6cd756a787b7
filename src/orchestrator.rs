// src/orchestrator.rs
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use image::GrayImage;
use log::{error, info, warn};
use tokio::sync::{Mutex, mpsc, watch};

use crate::address::{AddressSource, resolve_lan_address};
use crate::config::Config;
use crate::error::PairError;
use crate::qr::QrEncoder;
use crate::server::{BuiltinPages, KeyCallback, PageRenderer, SessionOptions, SessionServer};
use crate::token::SessionToken;

/// Gets the key once a sender has submitted it.
pub trait KeyConsumer: Send + Sync + 'static {
    fn accept_key(&self, key: String);
}

impl KeyConsumer for mpsc::UnboundedSender<String> {
    fn accept_key(&self, key: String) {
        if self.send(key).is_err() {
            warn!("key receiver dropped before pairing finished");
        }
    }
}

/// What the receiver shows for a started attempt.
#[derive(Clone)]
pub struct PairingDisplay {
    pub url: String,
    pub token: SessionToken,
    pub port: u16,
    pub qr: Arc<GrayImage>,
}

impl fmt::Debug for PairingDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingDisplay")
            .field("token", &self.token)
            .field("port", &self.port)
            .field("qr", &self.qr.dimensions())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum PairingStatus {
    Idle,
    Ready(PairingDisplay),
    AddressUnavailable,
    /// Lost a port race; a fresh code is being generated.
    PortConflict { attempt: u32 },
    StartFailed(String),
    Paired,
    Stopped,
}

struct LiveSession {
    generation: u64,
    server: SessionServer,
    display: PairingDisplay,
}

struct Inner {
    config: Config,
    addresses: Arc<dyn AddressSource>,
    pages: Arc<dyn PageRenderer>,
    encoder: QrEncoder,
    consumer: Arc<dyn KeyConsumer>,
    live: Mutex<Option<LiveSession>>,
    generation: AtomicU64,
    status: watch::Sender<PairingStatus>,
}

/// Drives pairing attempts for one receiver. At most one session is live.
#[derive(Clone)]
pub struct PairingOrchestrator {
    inner: Arc<Inner>,
}

impl PairingOrchestrator {
    pub fn new(
        config: Config,
        addresses: Arc<dyn AddressSource>,
        consumer: impl KeyConsumer,
    ) -> Self {
        Self::with_pages(config, addresses, consumer, Arc::new(BuiltinPages))
    }

    pub fn with_pages(
        config: Config,
        addresses: Arc<dyn AddressSource>,
        consumer: impl KeyConsumer,
        pages: Arc<dyn PageRenderer>,
    ) -> Self {
        let (status, _) = watch::channel(PairingStatus::Idle);
        let encoder = QrEncoder::new(config.qr_size);
        Self {
            inner: Arc::new(Inner {
                config,
                addresses,
                pages,
                encoder,
                consumer: Arc::new(consumer),
                live: Mutex::new(None),
                generation: AtomicU64::new(0),
                status,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingStatus> {
        self.inner.status.subscribe()
    }

    pub async fn current(&self) -> Option<PairingDisplay> {
        self.inner.live.lock().await.as_ref().map(|s| s.display.clone())
    }

    /// One attempt on the configured port. Replaces any live session.
    pub async fn start(&self) -> Result<PairingDisplay, PairError> {
        self.inner.attempt(self.inner.config.port, 1).await
    }

    /// Shows a new code, invalidating the current one.
    pub async fn restart(&self) -> Result<PairingDisplay, PairError> {
        self.start().await
    }

    /// Like [`start`](Self::start), but port conflicts are retried with a
    /// fresh token on an ephemeral port, up to `bind_attempts` times.
    pub async fn start_with_retry(&self) -> Result<PairingDisplay, PairError> {
        let attempts = self.inner.config.bind_attempts.max(1);
        let mut port = self.inner.config.port;
        let mut attempt = 1;
        loop {
            match self.inner.attempt(port, attempt).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    info!("retrying with a fresh code ({attempt}/{attempts} used): {e}");
                    attempt += 1;
                    port = 0;
                }
                result => return result,
            }
        }
    }

    /// Stops any live session. Never fails.
    pub async fn shutdown(&self) {
        let mut live = self.inner.live.lock().await;
        if let Some(mut session) = live.take() {
            session.server.stop().await;
        }
        self.inner.status.send_replace(PairingStatus::Stopped);
    }
}

impl Inner {
    async fn attempt(self: &Arc<Self>, port: u16, attempt: u32) -> Result<PairingDisplay, PairError> {
        let mut live = self.live.lock().await;
        if let Some(mut previous) = live.take() {
            previous.server.stop().await;
        }

        let ip = match resolve_lan_address(self.addresses.as_ref()) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("{e}");
                self.status.send_replace(PairingStatus::AddressUnavailable);
                return Err(e);
            }
        };

        let token = SessionToken::generate();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let options = SessionOptions {
            pages: self.pages.clone(),
            locale: self.config.locale_policy(),
            stop_grace: self.config.stop_grace(),
        };
        let mut server = SessionServer::new(token.clone(), self.completion(generation), options);

        let bound = match server.start(self.config.bind_addr, port).await {
            Ok(bound) => bound,
            Err(e) => {
                server.stop().await;
                let status = match &e {
                    PairError::PortBindConflict(_) => {
                        warn!("pairing attempt {attempt}: {e}");
                        PairingStatus::PortConflict { attempt }
                    }
                    other => {
                        error!("pairing server did not start: {other}");
                        PairingStatus::StartFailed(other.to_string())
                    }
                };
                self.status.send_replace(status);
                return Err(e);
            }
        };

        let url = format!("http://{ip}:{bound}/session/{token}");
        let qr = match self.encoder.render(&url) {
            Ok(qr) => qr,
            Err(e) => {
                server.stop().await;
                error!("{e}");
                self.status.send_replace(PairingStatus::StartFailed(e.to_string()));
                return Err(e);
            }
        };

        let display = PairingDisplay { url, token, port: bound, qr: Arc::new(qr) };
        info!("pairing code ready on {ip}:{bound} ({:?})", display.token);
        *live = Some(LiveSession { generation, server, display: display.clone() });
        self.status.send_replace(PairingStatus::Ready(display.clone()));
        Ok(display)
    }

    fn completion(self: &Arc<Self>, generation: u64) -> KeyCallback {
        let inner: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |key: String| {
            if let Some(inner) = inner.upgrade() {
                tokio::spawn(inner.complete(generation, key));
            }
        })
    }

    /// Finishes the attempt that accepted `key`. A session that was already
    /// replaced or shut down no longer owns the display, so its key is dropped.
    async fn complete(self: Arc<Self>, generation: u64, key: String) {
        let mut live = self.live.lock().await;
        let Some(mut session) = live.take_if(|s| s.generation == generation) else {
            warn!("discarding key from superseded pairing session (generation {generation})");
            return;
        };
        session.server.stop().await;
        self.status.send_replace(PairingStatus::Paired);
        self.consumer.accept_key(key);
    }
}
