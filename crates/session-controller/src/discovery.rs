//! Local network session discovery.
//!
//! Hosts broadcast a small UDP datagram per active session at a fixed
//! interval; browsers listen on the discovery port and fold sightings into a
//! [`SessionDirectory`]. Discovery is independent of pairing: seeing a session
//! grants nothing, a join still needs a descriptor or PIN.
//!
//! ```text
//! +--------+---------+--------------------------------------------------+
//! | "FSYN" | version | JSON {session_id, host_display_name, port,       |
//! | 4 B    | 1 B     |       chat_enabled, withdrawn}                    |
//! +--------+---------+--------------------------------------------------+
//! ```
//!
//! Only public sessions are advertised. A withdrawal is one datagram with
//! `withdrawn: true`. A host that vanishes
//! without withdrawing simply stops being re-observed and expires from the
//! directory.

use common::types::SessionId;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Magic bytes prefixing every discovery datagram.
pub const DISCOVERY_MAGIC: &[u8; 4] = b"FSYN";

/// Discovery datagram format version.
pub const DISCOVERY_PROTOCOL_VERSION: u8 = 1;

/// Largest datagram accepted by browsers.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

const DISCOVERY_CHANNEL_BUFFER: usize = 64;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid discovery datagram: {0}")]
    InvalidDatagram(String),

    #[error("Discovery record encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// The record a host broadcasts for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub session_id: SessionId,
    pub host_display_name: String,
    /// Port of the sync protocol listener.
    pub port: u16,
    /// Whether participants may chat in this session.
    #[serde(default = "default_chat_enabled")]
    pub chat_enabled: bool,
    #[serde(default)]
    pub withdrawn: bool,
}

fn default_chat_enabled() -> bool {
    true
}

/// Encode an advertisement datagram.
///
/// # Errors
///
/// Returns `DiscoveryError::InvalidDatagram` if the record does not fit in one datagram.
pub fn encode_advertisement(advertisement: &Advertisement) -> Result<Vec<u8>, DiscoveryError> {
    let body = serde_json::to_vec(advertisement)?;
    let mut datagram = Vec::with_capacity(DISCOVERY_MAGIC.len() + 1 + body.len());
    datagram.extend_from_slice(DISCOVERY_MAGIC);
    datagram.push(DISCOVERY_PROTOCOL_VERSION);
    datagram.extend_from_slice(&body);

    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(DiscoveryError::InvalidDatagram(format!(
            "{} bytes exceeds {MAX_DATAGRAM_SIZE}",
            datagram.len()
        )));
    }
    Ok(datagram)
}

/// Decode an advertisement datagram.
///
/// # Errors
///
/// Returns `DiscoveryError::InvalidDatagram` for foreign or unsupported
/// datagrams and `DiscoveryError::Json` for a malformed record.
pub fn decode_advertisement(datagram: &[u8]) -> Result<Advertisement, DiscoveryError> {
    let rest = datagram
        .strip_prefix(DISCOVERY_MAGIC.as_slice())
        .ok_or_else(|| DiscoveryError::InvalidDatagram("bad magic".to_string()))?;
    let (version, body) = rest
        .split_first()
        .ok_or_else(|| DiscoveryError::InvalidDatagram("missing version".to_string()))?;
    if *version != DISCOVERY_PROTOCOL_VERSION {
        return Err(DiscoveryError::InvalidDatagram(format!(
            "unsupported version {version}"
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

// ============================================================================
// Announcer
// ============================================================================

#[derive(Debug)]
enum DiscoveryCommand {
    Advertise(Advertisement),
    Withdraw(SessionId),
}

/// Handle to the announcer task.
#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    sender: mpsc::Sender<DiscoveryCommand>,
}

impl DiscoveryHandle {
    /// Start (or refresh) broadcasting `advertisement`.
    pub fn advertise(&self, advertisement: Advertisement) {
        if let Err(e) = self.sender.try_send(DiscoveryCommand::Advertise(advertisement)) {
            warn!(target: "sc.discovery", error = %e, "Failed to queue advertisement");
        }
    }

    /// Stop broadcasting `session_id` and announce the withdrawal.
    pub fn withdraw(&self, session_id: SessionId) {
        if let Err(e) = self.sender.try_send(DiscoveryCommand::Withdraw(session_id)) {
            warn!(target: "sc.discovery", error = %e, "Failed to queue withdrawal");
        }
    }
}

/// A session's advertisement bound to the announcer that broadcasts it.
#[derive(Debug, Clone)]
pub struct SessionAdvertiser {
    handle: DiscoveryHandle,
    record: Advertisement,
}

impl SessionAdvertiser {
    #[must_use]
    pub fn new(handle: DiscoveryHandle, record: Advertisement) -> Self {
        Self { handle, record }
    }

    pub fn advertise(&self) {
        self.handle.advertise(self.record.clone());
    }

    pub fn withdraw(&self) {
        self.handle.withdraw(self.record.session_id);
    }
}

/// Broadcasts advertisements of the sessions hosted by this process.
pub struct DiscoveryAnnouncer {
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    receiver: mpsc::Receiver<DiscoveryCommand>,
    cancel_token: CancellationToken,
    advertised: HashMap<SessionId, Advertisement>,
}

impl DiscoveryAnnouncer {
    /// Bind an ephemeral broadcast-enabled socket and spawn the announcer.
    ///
    /// `target` is normally `255.255.255.255:<discovery_port>`.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Io` if the socket cannot be bound.
    pub async fn spawn(
        target: SocketAddr,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> Result<(DiscoveryHandle, JoinHandle<()>), DiscoveryError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.set_broadcast(true)?;

        let (sender, receiver) = mpsc::channel(DISCOVERY_CHANNEL_BUFFER);
        let announcer = Self {
            socket,
            target,
            interval,
            receiver,
            cancel_token,
            advertised: HashMap::new(),
        };
        let task_handle = tokio::spawn(announcer.run());

        Ok((DiscoveryHandle { sender }, task_handle))
    }

    /// Broadcast target for `port` on the local network.
    #[must_use]
    pub fn broadcast_target(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::BROADCAST, port))
    }

    #[instrument(skip_all, name = "sc.discovery", fields(discovery_target = %self.target))]
    async fn run(mut self) {
        info!(
            target: "sc.discovery",
            target_addr = %self.target,
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Discovery announcer started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    let sessions: Vec<SessionId> = self.advertised.keys().copied().collect();
                    for session_id in sessions {
                        self.withdraw(session_id).await;
                    }
                    break;
                }

                _ = ticker.tick() => {
                    for advertisement in self.advertised.values() {
                        self.send(advertisement).await;
                    }
                }

                command = self.receiver.recv() => {
                    match command {
                        Some(DiscoveryCommand::Advertise(advertisement)) => {
                            debug!(
                                target: "sc.discovery",
                                session_id = %advertisement.session_id,
                                "Advertising session"
                            );
                            self.send(&advertisement).await;
                            self.advertised.insert(advertisement.session_id, advertisement);
                        }
                        Some(DiscoveryCommand::Withdraw(session_id)) => {
                            self.withdraw(session_id).await;
                        }
                        None => break,
                    }
                }
            }
        }

        info!(target: "sc.discovery", "Discovery announcer stopped");
    }

    async fn withdraw(&mut self, session_id: SessionId) {
        if let Some(mut advertisement) = self.advertised.remove(&session_id) {
            advertisement.withdrawn = true;
            self.send(&advertisement).await;
            debug!(target: "sc.discovery", session_id = %session_id, "Withdrew session");
        }
    }

    async fn send(&self, advertisement: &Advertisement) {
        let datagram = match encode_advertisement(advertisement) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(target: "sc.discovery", error = %e, "Failed to encode advertisement");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&datagram, self.target).await {
            warn!(target: "sc.discovery", error = %e, "Failed to send advertisement");
        }
    }
}

// ============================================================================
// Browser
// ============================================================================

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub advertisement: Advertisement,
    /// Sender of the datagram; its IP is the host's address.
    pub from: SocketAddr,
    pub seen_at: Instant,
}

/// Listens for advertisements on the discovery port.
#[derive(Debug, Clone)]
pub struct DiscoveryBrowser {
    socket: Arc<UdpSocket>,
}

impl DiscoveryBrowser {
    /// # Errors
    ///
    /// Returns `DiscoveryError::Io` if the port cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// # Errors
    ///
    /// Returns `DiscoveryError::Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Lazy stream of sightings.
    ///
    /// Foreign datagrams are skipped. The stream may repeat a session on every
    /// announce interval and ends on a socket error; call again to restart.
    pub fn sightings(&self) -> impl Stream<Item = Sighting> {
        stream::unfold(Arc::clone(&self.socket), |socket| async move {
            loop {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(target: "sc.discovery", error = %e, "Discovery receive failed");
                        return None;
                    }
                };
                buf.truncate(len);

                match decode_advertisement(&buf) {
                    Ok(advertisement) => {
                        let sighting = Sighting {
                            advertisement,
                            from,
                            seen_at: Instant::now(),
                        };
                        return Some((sighting, socket));
                    }
                    Err(e) => {
                        debug!(target: "sc.discovery", from = %from, error = %e, "Ignored datagram");
                    }
                }
            }
        })
    }
}

/// A session as currently visible to a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSession {
    pub session_id: SessionId,
    pub host_display_name: String,
    /// Host IP with the advertised sync port.
    pub address: SocketAddr,
    pub chat_enabled: bool,
    pub last_seen: Instant,
}

/// Caller-side view of discovered sessions.
///
/// Deduplicates by session id and hides entries not re-observed within the
/// expiry timeout.
#[derive(Debug)]
pub struct SessionDirectory {
    expiry: Duration,
    entries: HashMap<SessionId, DiscoveredSession>,
}

impl SessionDirectory {
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: HashMap::new(),
        }
    }

    pub fn observe(&mut self, sighting: Sighting) {
        let Sighting {
            advertisement,
            from,
            seen_at,
        } = sighting;

        if advertisement.withdrawn {
            self.entries.remove(&advertisement.session_id);
            return;
        }

        self.entries.insert(
            advertisement.session_id,
            DiscoveredSession {
                session_id: advertisement.session_id,
                host_display_name: advertisement.host_display_name,
                address: SocketAddr::new(from.ip(), advertisement.port),
                chat_enabled: advertisement.chat_enabled,
                last_seen: seen_at,
            },
        );
    }

    /// Sessions seen within the expiry timeout before `now`.
    #[must_use]
    pub fn active(&self, now: Instant) -> Vec<DiscoveredSession> {
        self.entries
            .values()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) < self.expiry)
            .cloned()
            .collect()
    }

    /// Forget expired entries.
    pub fn prune(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) < expiry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn advertisement(name: &str) -> Advertisement {
        Advertisement {
            session_id: SessionId::new(),
            host_display_name: name.to_string(),
            port: 7420,
            chat_enabled: true,
            withdrawn: false,
        }
    }

    fn sighting(advertisement: Advertisement, seen_at: Instant) -> Sighting {
        Sighting {
            advertisement,
            from: "192.168.1.20:50000".parse().unwrap(),
            seen_at,
        }
    }

    #[test]
    fn test_datagram_layout() {
        let ad = advertisement("Living Room");
        let datagram = encode_advertisement(&ad).unwrap();
        assert!(datagram.starts_with(b"FSYN"));
        assert_eq!(datagram.get(4), Some(&DISCOVERY_PROTOCOL_VERSION));
        assert_eq!(decode_advertisement(&datagram).unwrap(), ad);
    }

    #[test]
    fn test_foreign_datagrams_are_rejected() {
        assert!(matches!(
            decode_advertisement(b"TPOS\x01{}"),
            Err(DiscoveryError::InvalidDatagram(_))
        ));
        assert!(matches!(
            decode_advertisement(b"FSYN"),
            Err(DiscoveryError::InvalidDatagram(_))
        ));
        assert!(matches!(
            decode_advertisement(b"FSYN\x09{}"),
            Err(DiscoveryError::InvalidDatagram(_))
        ));
        assert!(matches!(
            decode_advertisement(b"FSYN\x01not json"),
            Err(DiscoveryError::Json(_))
        ));
    }

    #[test]
    fn test_record_without_chat_flag_defaults_to_enabled() {
        let session_id = SessionId::new();
        let mut datagram = b"FSYN\x01".to_vec();
        datagram.extend_from_slice(
            format!(r#"{{"session_id":"{session_id}","host_display_name":"Attic","port":7420}}"#)
                .as_bytes(),
        );
        let ad = decode_advertisement(&datagram).unwrap();
        assert!(ad.chat_enabled);
        assert!(!ad.withdrawn);
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let ad = advertisement(&"x".repeat(MAX_DATAGRAM_SIZE));
        assert!(matches!(
            encode_advertisement(&ad),
            Err(DiscoveryError::InvalidDatagram(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_dedups_and_expires() {
        let mut directory = SessionDirectory::new(Duration::from_secs(15));
        let ad = advertisement("Kitchen");
        let start = Instant::now();

        directory.observe(sighting(ad.clone(), start));
        directory.observe(sighting(ad.clone(), start + Duration::from_secs(5)));
        assert_eq!(directory.len(), 1);

        let active = directory.active(start + Duration::from_secs(10));
        assert_eq!(active.len(), 1);
        let entry = active.first().unwrap();
        assert_eq!(entry.address, "192.168.1.20:7420".parse().unwrap());
        assert_eq!(entry.host_display_name, "Kitchen");

        // 15s after the last sighting it is gone from the view
        assert!(directory.active(start + Duration::from_secs(20)).is_empty());
        directory.prune(start + Duration::from_secs(20));
        assert!(directory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawal_removes_entry() {
        let mut directory = SessionDirectory::new(Duration::from_secs(15));
        let mut ad = advertisement("Office");
        let now = Instant::now();

        directory.observe(sighting(ad.clone(), now));
        ad.withdrawn = true;
        directory.observe(sighting(ad, now));
        assert!(directory.active(now).is_empty());
    }

    #[tokio::test]
    async fn test_announcer_to_browser_over_loopback() {
        let browser = DiscoveryBrowser::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let target = browser.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let (handle, task) =
            DiscoveryAnnouncer::spawn(target, Duration::from_millis(50), cancel.clone())
                .await
                .unwrap();

        let ad = advertisement("Den");
        let advertiser = SessionAdvertiser::new(handle, ad.clone());
        advertiser.advertise();

        let mut sightings = Box::pin(browser.sightings());
        let first = tokio::time::timeout(Duration::from_secs(2), sightings.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.advertisement, ad);

        advertiser.withdraw();
        let withdrawn = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(s) = sightings.next().await {
                if s.advertisement.withdrawn {
                    return s;
                }
            }
            unreachable!("sighting stream ended");
        })
        .await
        .unwrap();
        assert_eq!(withdrawn.advertisement.session_id, ad.session_id);

        cancel.cancel();
        task.await.unwrap();
    }
}
