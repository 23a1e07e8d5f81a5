//! Per-peer status subscriptions and the heartbeat supervisor.
//!
//! Each joined peer gets one worker task: bootstrap HTTP fetch, then a
//! persistent `/ws` subscription merging delta frames into the cached
//! snapshot. `last_seen` moves only on successfully parsed messages, never
//! on connect. A peer without a stream endpoint falls back to plain HTTP
//! polling. The supervisor reconciles workers with membership once a second
//! and flips peers offline when their heartbeat window expires.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use crate::models::{EvseStatus, StatusDelta};
use crate::state::{AppState, SyncEvent};
use crate::utils::net;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const BOOTSTRAP_BACKOFF_S: [u64; 3] = [1, 2, 4];

/// Reconnect backoff: 1, 2, 4, ... capped at 60 s. Reset on any parsed
/// message.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let secs = (1u64 << self.attempt.min(6)).min(60);
        self.attempt = (self.attempt + 1).min(6);
        Duration::from_secs(secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum Update {
    Full(EvseStatus),
    Delta(StatusDelta),
}

/// Fold one parsed message into the peer record and fan out the signals:
/// allocator on mutation, config sync on fingerprint drift. Returns `None`
/// when the peer has been removed from the group.
async fn ingest(state: &AppState, host: &str, update: Update) -> Option<()> {
    let (changed, version, hash) = {
        let mut peers = state.peers.write().await;
        let record = peers.get_mut(host)?;

        let old = record.status.clone();
        let new = match update {
            Update::Full(status) => status,
            Update::Delta(delta) => {
                let mut merged = old.clone().unwrap_or_default();
                delta.apply(&mut merged);
                merged
            }
        };

        if let Some(ref id) = new.id {
            if !id.is_empty() {
                record.device_id = id.clone();
            }
        }
        let came_online = !record.online;
        record.online = true;
        record.last_seen = Some(Instant::now());

        let changed = came_online || old.as_ref() != Some(&new);
        let fingerprint = (new.config_version, new.config_hash.clone());
        record.status = Some(new);
        (changed, fingerprint.0, fingerprint.1)
    };

    // A peer that advertises no fingerprint at all does not take part in
    // config sync.
    if !(hash.is_empty() && version == 0) {
        let (local_version, local_hash) = state.fingerprint().await;
        if version != local_version || hash != local_hash {
            let _ = state.sync_tx.send(SyncEvent {
                host: host.to_string(),
                peer_version: version,
                peer_hash: hash,
            });
        } else if state.divergences.write().await.remove(host).is_some() {
            state.alloc_notify.notify_one();
        }
    }

    if changed {
        state.alloc_notify.notify_one();
    }
    Some(())
}

async fn fetch_status(client: &reqwest::Client, host: &str) -> crate::error::Result<EvseStatus> {
    let url = format!("{}/status", net::peer_base_url(host));
    let status = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<EvseStatus>()
        .await?;
    Ok(status)
}

/// Sleep unless shutdown arrives first. Returns true on shutdown.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Initial HTTP fetch with short backoff; the stream is opened regardless
/// of the outcome. Returns false when the worker should stop.
async fn bootstrap(
    state: &AppState,
    client: &reqwest::Client,
    host: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    for (attempt, delay) in BOOTSTRAP_BACKOFF_S.iter().enumerate() {
        match fetch_status(client, host).await {
            Ok(status) => {
                return ingest(state, host, Update::Full(status)).await.is_some();
            }
            Err(e) => {
                debug!("bootstrap fetch {} attempt {}: {}", host, attempt + 1, e);
                if sleep_or_shutdown(shutdown, Duration::from_secs(*delay)).await {
                    return false;
                }
            }
        }
    }
    true
}

enum StreamEnd {
    Disconnected,
    NotFound,
    PeerGone,
    Shutdown,
}

/// One stream session: connect, snapshot, then delta frames until the
/// connection drops. Parse errors drop the frame and leave `last_seen`
/// untouched.
async fn stream_once(
    state: &AppState,
    host: &str,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> StreamEnd {
    let url = net::peer_ws_url(host);
    let connect = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str())).await;
    let mut stream = match connect {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(WsError::Http(response))) if response.status() == 404 => {
            return StreamEnd::NotFound;
        }
        Ok(Err(e)) => {
            debug!("stream connect {}: {}", host, e);
            return StreamEnd::Disconnected;
        }
        Err(_) => {
            debug!("stream connect {}: handshake timeout", host);
            return StreamEnd::Disconnected;
        }
    };

    debug!("stream open to {}", host);
    let mut first = true;

    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => return StreamEnd::Shutdown,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let update = if first {
                    serde_json::from_str::<EvseStatus>(&text).map(Update::Full)
                } else {
                    serde_json::from_str::<StatusDelta>(&text).map(Update::Delta)
                };
                match update {
                    Ok(update) => {
                        first = false;
                        backoff.reset();
                        if ingest(state, host, update).await.is_none() {
                            return StreamEnd::PeerGone;
                        }
                    }
                    Err(e) => debug!("unparsable frame from {}: {}", host, e),
                }
            }
            Some(Ok(Message::Close(_))) | None => return StreamEnd::Disconnected,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("stream read {}: {}", host, e);
                return StreamEnd::Disconnected;
            }
        }
    }
}

/// Fallback for peers whose firmware has no stream endpoint: poll the
/// status resource at a third of the heartbeat window.
async fn poll_loop(
    state: &AppState,
    client: &reqwest::Client,
    host: &str,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        let heartbeat_s = state.config.read().await.heartbeat_timeout_s as u64;
        let interval = Duration::from_secs((heartbeat_s / 3).max(1));
        if sleep_or_shutdown(shutdown, interval).await {
            return;
        }

        match fetch_status(client, host).await {
            Ok(status) => {
                if ingest(state, host, Update::Full(status)).await.is_none() {
                    return;
                }
            }
            Err(e) => debug!("poll {}: {}", host, e),
        }
    }
}

/// Worker task for one joined peer.
pub async fn run_peer_worker(state: AppState, host: String) {
    let mut shutdown = state.shutdown.clone();
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .build()
        .unwrap_or_default();

    if !bootstrap(&state, &client, &host, &mut shutdown).await {
        return;
    }

    let mut backoff = Backoff::default();
    loop {
        if *shutdown.borrow() {
            return;
        }
        match stream_once(&state, &host, &mut shutdown, &mut backoff).await {
            StreamEnd::Shutdown | StreamEnd::PeerGone => return,
            StreamEnd::NotFound => {
                info!("peer {} has no stream endpoint, falling back to polling", host);
                poll_loop(&state, &client, &host, &mut shutdown).await;
                return;
            }
            StreamEnd::Disconnected => {
                // Cached snapshot is retained; last_seen stays frozen until
                // the next parsed message.
                if sleep_or_shutdown(&mut shutdown, backoff.next_delay()).await {
                    return;
                }
            }
        }
    }
}

/// Supervisor pass: reconcile workers with membership and enforce the
/// heartbeat window.
pub async fn run_supervisor(state: AppState) {
    let mut shutdown = state.shutdown.clone();
    let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let joined: HashSet<String> = state.peers.read().await.keys().cloned().collect();

        workers.retain(|host, handle| {
            if !joined.contains(host) {
                handle.abort();
                return false;
            }
            !handle.is_finished()
        });
        for host in &joined {
            if !workers.contains_key(host) {
                workers.insert(
                    host.clone(),
                    tokio::spawn(run_peer_worker(state.clone(), host.clone())),
                );
            }
        }

        let heartbeat =
            Duration::from_secs(state.config.read().await.heartbeat_timeout_s as u64);
        let mut lost = false;
        {
            let mut peers = state.peers.write().await;
            for record in peers.values_mut() {
                let expired = record
                    .last_seen
                    .map_or(true, |seen| seen.elapsed() > heartbeat);
                if record.online && expired {
                    record.online = false;
                    lost = true;
                    info!("peer {} heartbeat lost", record.host);
                }
            }
        }
        if lost {
            // Failsafe and allocator both re-evaluate on this signal
            state.alloc_notify.notify_one();
        }
    }

    for (_, handle) in workers {
        handle.abort();
    }
}
