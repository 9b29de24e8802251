//! Work executed by pool workers.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::future::BoxFuture;
use hub_proto::{
    CodecError, FailoverAck, FailoverPlayer, Frame, Message, PeerRole, PlayerReport, Userinfo,
    decode_pairs,
};
use hub_store::{EntryId, GossipRecord, Outbox, RecordStore, Sighting};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::RelaySettings;
use crate::directory::{Peer, PeerDirectory};
use crate::error::RelayError;
use crate::pool::Task;
use crate::stats::RelayStats;

/// State shared read-only by every worker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) settings: RelaySettings,
    pub(crate) directory: PeerDirectory,
    pub(crate) stats: Arc<RelayStats>,
    flush_running: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        settings: RelaySettings,
        directory: PeerDirectory,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            settings,
            directory,
            stats,
            flush_running: AtomicBool::new(false),
        }
    }
}

/// A task for the relay's worker pool.
pub enum RelayTask {
    /// A datagram from a known sender, to be authenticated and acted on.
    Datagram {
        /// Raw datagram bytes.
        payload: Vec<u8>,
        /// Sender address.
        from: SocketAddr,
    },
    /// Replay every pending outbox entry to the downstream peers.
    Flush,
}

impl fmt::Debug for RelayTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram { payload, from } => {
                write!(f, "Datagram {{ from: {from}, payload: \"{}\" }}", payload.escape_ascii())
            }
            Self::Flush => write!(f, "Flush"),
        }
    }
}

/// A worker's storage handle. Calls run on the blocking pool, off the runtime
/// threads the dispatcher shares.
struct Offloaded<S: ?Sized>(Arc<Mutex<Box<S>>>);

impl<S: ?Sized + Send + 'static> Offloaded<S> {
    fn new(store: Box<S>) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    async fn call<T, F>(&self, call: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> hub_store::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.0);
        let result = tokio::task::spawn_blocking(move || {
            let mut store = store.lock();
            call(&mut **store)
        })
        .await
        .map_err(|e| RelayError::Blocking(e.to_string()))?;
        Ok(result?)
    }
}

/// The private state of one worker.
pub struct WorkerContext {
    worker: usize,
    shared: Arc<Shared>,
    records: Offloaded<dyn RecordStore>,
    outbox: Option<Offloaded<dyn Outbox>>,
    socket: UdpSocket,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker", &self.worker)
            .field("failover", &self.outbox.is_some())
            .field("socket", &self.socket.local_addr().ok())
            .finish_non_exhaustive()
    }
}

impl Task<WorkerContext> for RelayTask {
    fn run<'a>(self, ctx: &'a mut WorkerContext) -> BoxFuture<'a, Result<(), RelayError>> {
        Box::pin(async move {
            match self {
                Self::Datagram { payload, from } => ctx.handle_datagram(&payload, from).await,
                Self::Flush => ctx.flush().await,
            }
        })
    }
}

/// Clears the flush flag when the flush ends, however it ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WorkerContext {
    /// Builds a worker context with its own outbound socket bound on the
    /// relay host.
    pub(crate) fn new(
        worker: usize,
        shared: Arc<Shared>,
        records: Box<dyn RecordStore>,
        outbox: Option<Box<dyn Outbox>>,
    ) -> Result<Self, RelayError> {
        let addr = format!("{}:0", shared.settings.host);
        let socket = std::net::UdpSocket::bind(&addr)
            .and_then(|socket| {
                socket.set_nonblocking(true)?;
                Ok(socket)
            })
            .map_err(|source| RelayError::Bind { addr, source })?;
        let socket = UdpSocket::from_std(socket)?;

        Ok(Self {
            worker,
            shared,
            records: Offloaded::new(records),
            outbox: outbox.map(Offloaded::new),
            socket,
        })
    }

    async fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<(), RelayError> {
        let shared = Arc::clone(&self.shared);
        let address = from.ip().to_canonical().to_string();

        let frame = match Frame::split(datagram) {
            Ok(frame) => frame,
            Err(e) => return self.reject(from, &e),
        };
        let kind = match frame.classify() {
            Ok((kind, _)) => kind,
            Err(e) => return self.reject(from, &e),
        };

        let role = kind.sender_role();
        let Some(peer) = shared.directory.peer(role, &address) else {
            debug!(%from, %kind, %role, "sender not configured for this message kind, dropping");
            shared.stats.record_rejected();
            return Ok(());
        };

        let framing = match role {
            PeerRole::Source => shared.settings.source_framing,
            PeerRole::Upstream | PeerRole::Downstream => shared.settings.peer_framing,
        };
        let message = match shared.settings.codec.open(&frame, framing, peer.secret.expose()) {
            Ok(message) => message,
            Err(e) => return self.reject(from, &e),
        };

        match message {
            Message::Userinfo(userinfo) => self.on_userinfo(userinfo, from).await,
            Message::GossipPlayer(report) => self.on_gossip(report, peer).await,
            Message::FailoverPlayer(failover) => self.on_failover(failover, peer).await,
            Message::FailoverAck(ack) => self.on_ack(ack, peer).await,
        }
    }

    fn reject(&self, from: SocketAddr, error: &CodecError) -> Result<(), RelayError> {
        debug!(worker = self.worker, %from, error = %error, "dropping datagram");
        self.shared.stats.record_rejected();
        Ok(())
    }

    async fn on_userinfo(
        &mut self,
        userinfo: Userinfo,
        from: SocketAddr,
    ) -> Result<(), RelayError> {
        let now = Utc::now();
        let report = PlayerReport {
            server: from.ip().to_canonical().to_string(),
            port: from.port(),
            name: userinfo.name,
            ip: userinfo.ip,
            guid: userinfo.guid,
        };

        // Encoded before anything is stored, so a sighting is never recorded
        // without its outbox entry.
        let payload = self.outbox.as_ref().map(|_| report.to_pairs()).transpose()?;

        let sighting = sighting_of(&report);
        self.records
            .call(move |records| records.upsert_sighting(&sighting, now))
            .await?;
        self.shared.stats.record_sighting();

        if let (Some(outbox), Some(payload)) = (&self.outbox, payload) {
            let (server, port) = (report.server.clone(), report.port);
            let id = outbox
                .call(move |outbox| outbox.enqueue(&server, port, &payload, now))
                .await?;
            self.shared.stats.record_enqueued();
            debug!(
                worker = self.worker,
                %id,
                name = %report.name,
                "queued sighting for failover delivery"
            );
            return Ok(());
        }

        let message = Message::GossipPlayer(report);
        for peer in self.shared.directory.peers(PeerRole::Downstream) {
            send_to(&self.socket, &self.shared, peer, &message).await;
        }
        Ok(())
    }

    async fn on_gossip(&mut self, report: PlayerReport, peer: &Peer) -> Result<(), RelayError> {
        let record = GossipRecord {
            sighting: sighting_of(&report),
            origin: peer.origin(),
        };
        let now = Utc::now();
        self.records
            .call(move |records| records.upsert_gossip(&record, now))
            .await?;
        self.shared.stats.record_gossip();
        Ok(())
    }

    async fn on_failover(
        &mut self,
        failover: FailoverPlayer,
        peer: &Peer,
    ) -> Result<(), RelayError> {
        self.on_gossip(failover.report, peer).await?;
        let ack = Message::FailoverAck(FailoverAck { id: failover.id });
        send_to(&self.socket, &self.shared, peer, &ack).await;
        Ok(())
    }

    async fn on_ack(&mut self, ack: FailoverAck, peer: &Peer) -> Result<(), RelayError> {
        let Some(outbox) = &self.outbox else {
            debug!(
                id = ack.id,
                peer = %peer.name,
                "ignoring acknowledgment outside failover mode"
            );
            return Ok(());
        };
        let id = EntryId(ack.id);
        if outbox.call(move |outbox| outbox.acknowledge(id)).await? {
            self.shared.stats.record_acknowledged();
            debug!(%id, peer = %peer.name, "outbox entry acknowledged");
        } else {
            debug!(%id, peer = %peer.name, "acknowledgment for an entry that is not pending");
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), RelayError> {
        let Some(outbox) = &self.outbox else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        if shared.flush_running.swap(true, Ordering::AcqRel) {
            debug!(worker = self.worker, "flush already in progress");
            return Ok(());
        }
        let _guard = FlushGuard(&shared.flush_running);

        let pending = outbox.call(|outbox| outbox.pending()).await?;
        shared.stats.record_flush();
        let Some(oldest) = pending.first() else {
            return Ok(());
        };
        let age = Utc::now().signed_duration_since(oldest.created_at);
        info!(
            pending = pending.len(),
            oldest_id = %oldest.id,
            oldest_age_secs = age.num_seconds(),
            "flushing outbox"
        );

        for entry in &pending {
            let decoded =
                decode_pairs(&entry.payload).and_then(|pairs| PlayerReport::from_pairs(&pairs));
            let report = match decoded {
                Ok(report) => report,
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "skipping undecodable outbox entry");
                    continue;
                }
            };
            let message = Message::FailoverPlayer(FailoverPlayer {
                id: entry.id.0,
                report,
                time: Some(entry.created_at),
            });
            for peer in shared.directory.peers(PeerRole::Downstream) {
                send_to(&self.socket, &shared, peer, &message).await;
            }
        }
        Ok(())
    }
}

async fn send_to(socket: &UdpSocket, shared: &Shared, peer: &Peer, message: &Message) {
    let settings = &shared.settings;
    let sealed = settings.codec.seal(settings.peer_framing, peer.secret.expose(), message);
    let datagram = match sealed {
        Ok(datagram) => datagram,
        Err(e) => {
            warn!(peer = %peer.name, kind = %message.kind(), error = %e, "failed to encode");
            shared.stats.record_send_failure();
            return;
        }
    };

    match socket.send_to(&datagram, peer.destination()).await {
        Ok(_) => shared.stats.record_sent(),
        Err(e) => {
            warn!(
                peer = %peer.name,
                address = %peer.address,
                port = peer.send_port,
                kind = %message.kind(),
                error = %e,
                "failed to send to peer"
            );
            shared.stats.record_send_failure();
        }
    }
}

fn sighting_of(report: &PlayerReport) -> Sighting {
    Sighting {
        name: report.name.clone(),
        address: report.ip.clone(),
        guid: report.guid.clone(),
        server: report.server.clone(),
        port: report.port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hub_proto::{Codec, Framing};
    use hub_store::{OutboxBackend, RecordBackend, Store};

    const SOURCE_SECRET: &str = "somesecret";
    const HUB_SECRET: &str = "youcantknow";

    fn source_addr() -> SocketAddr {
        "127.0.0.1:27960".parse().expect("addr")
    }

    fn directory(downstream_port: u16) -> PeerDirectory {
        PeerDirectory::from_peers([
            Peer::new(PeerRole::Source, "game", "127.0.0.1", 27967, SOURCE_SECRET),
            Peer::new(PeerRole::Upstream, "hub", "127.0.0.1", 9534, HUB_SECRET),
            Peer::new(PeerRole::Downstream, "hub", "127.0.0.1", 9535, HUB_SECRET)
                .with_send_port(downstream_port),
        ])
        .expect("directory")
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            host: "127.0.0.1".to_string(),
            ..RelaySettings::default()
        }
    }

    fn context(store: &Store, failover: bool, downstream_port: u16) -> WorkerContext {
        let shared = Arc::new(Shared::new(
            settings(),
            directory(downstream_port),
            Arc::new(RelayStats::default()),
        ));
        let outbox = failover.then(|| store.open_outbox().expect("outbox"));
        WorkerContext::new(0, shared, store.open_records().expect("records"), outbox)
            .expect("context")
    }

    fn userinfo_datagram(secret: &str) -> Vec<u8> {
        let message = Message::Userinfo(Userinfo {
            name: "|ALPHA| CCCP".to_string(),
            ip: "1.2.3.4".to_string(),
            guid: "CCCPCCCPCCCPCCCPCCCPCCCPCCCPCCCP".to_string(),
        });
        Codec::default()
            .seal(Framing::Connectionless, secret.as_bytes(), &message)
            .expect("seal")
    }

    async fn receiver() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver")
    }

    async fn receive(socket: &UdpSocket) -> Message {
        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram arrives")
            .expect("recv");
        let frame = Frame::split(&buf[..len]).expect("split");
        Codec::default()
            .open(&frame, Framing::Bare, HUB_SECRET.as_bytes())
            .expect("open")
    }

    #[test]
    fn test_debug_escapes_payload() {
        let task = RelayTask::Datagram {
            payload: b"\xff\xff\xff\xfftoken\nuserinfo".to_vec(),
            from: source_addr(),
        };
        let debug = format!("{task:?}");
        assert!(debug.contains("127.0.0.1:27960"));
        assert!(debug.contains("\\xff"));
        assert!(debug.contains("\\n"));
    }

    #[tokio::test]
    async fn test_userinfo_gossips_to_downstream() {
        let store = Store::in_memory();
        let downstream = receiver().await;
        let port = downstream.local_addr().expect("addr").port();
        let mut ctx = context(&store, false, port);

        RelayTask::Datagram {
            payload: userinfo_datagram(SOURCE_SECRET),
            from: source_addr(),
        }
        .run(&mut ctx)
        .await
        .expect("task");

        let sightings = store.handle().sightings().expect("sightings");
        assert_eq!(sightings.len(), 1);
        assert_eq!(sightings[0].record.server, "127.0.0.1");
        assert_eq!(sightings[0].record.port, 27960);

        match receive(&downstream).await {
            Message::GossipPlayer(report) => {
                assert_eq!(report.name, "|ALPHA| CCCP");
                assert_eq!(report.server, "127.0.0.1");
                assert_eq!(report.port, 27960);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_secret_is_dropped() {
        let store = Store::in_memory();
        let mut ctx = context(&store, false, 9);

        RelayTask::Datagram {
            payload: userinfo_datagram("not the secret"),
            from: source_addr(),
        }
        .run(&mut ctx)
        .await
        .expect("drops are not task failures");

        assert_eq!(store.handle().sighting_count().expect("count"), 0);
        assert_eq!(ctx.shared.stats.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_gossip_from_source_role_is_dropped() {
        let store = Store::in_memory();
        let mut ctx = context(&store, false, 9);
        let report = PlayerReport {
            server: "3.4.5.6".to_string(),
            port: 27960,
            name: "x".to_string(),
            ip: "1.2.3.4".to_string(),
            guid: "g".to_string(),
        };
        let datagram = Codec::default()
            .seal(Framing::Bare, HUB_SECRET.as_bytes(), &Message::GossipPlayer(report))
            .expect("seal");
        let not_upstream: SocketAddr = "127.0.0.2:9534".parse().expect("addr");

        RelayTask::Datagram {
            payload: datagram,
            from: not_upstream,
        }
        .run(&mut ctx)
        .await
        .expect("task");

        assert_eq!(store.handle().gossip_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn test_failover_enqueues_then_flush_replays_and_ack_clears() {
        let store = Store::in_memory();
        let downstream = receiver().await;
        let port = downstream.local_addr().expect("addr").port();
        let mut ctx = context(&store, true, port);

        RelayTask::Datagram {
            payload: userinfo_datagram(SOURCE_SECRET),
            from: source_addr(),
        }
        .run(&mut ctx)
        .await
        .expect("task");
        assert_eq!(store.handle().pending_count().expect("pending"), 1);

        RelayTask::Flush.run(&mut ctx).await.expect("flush");
        let id = match receive(&downstream).await {
            Message::FailoverPlayer(failover) => {
                assert_eq!(failover.report.name, "|ALPHA| CCCP");
                assert!(failover.time.is_some());
                failover.id
            }
            other => panic!("unexpected message {other:?}"),
        };

        let ack = Codec::default()
            .seal(Framing::Bare, HUB_SECRET.as_bytes(), &Message::FailoverAck(FailoverAck { id }))
            .expect("seal");
        RelayTask::Datagram {
            payload: ack,
            from: "127.0.0.1:9535".parse().expect("addr"),
        }
        .run(&mut ctx)
        .await
        .expect("ack");

        assert_eq!(store.handle().pending_count().expect("pending"), 0);
        assert_eq!(store.handle().sighting_count().expect("count"), 1);
        assert_eq!(ctx.shared.stats.snapshot().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_failover_player_is_stored_and_acknowledged() {
        let store = Store::in_memory();
        let upstream = receiver().await;
        let upstream_port = upstream.local_addr().expect("addr").port();
        let shared = Arc::new(Shared::new(
            settings(),
            PeerDirectory::from_peers([
                Peer::new(PeerRole::Upstream, "hub", "127.0.0.1", 9534, HUB_SECRET)
                    .with_send_port(upstream_port),
            ])
            .expect("directory"),
            Arc::new(RelayStats::default()),
        ));
        let mut ctx = WorkerContext::new(0, shared, store.open_records().expect("records"), None)
            .expect("context");

        let failover = FailoverPlayer {
            id: 42,
            report: PlayerReport {
                server: "3.4.5.6".to_string(),
                port: 27960,
                name: "x".to_string(),
                ip: "1.2.3.4".to_string(),
                guid: "g".to_string(),
            },
            time: None,
        };
        let datagram = Codec::default()
            .seal(Framing::Bare, HUB_SECRET.as_bytes(), &Message::FailoverPlayer(failover))
            .expect("seal");

        RelayTask::Datagram {
            payload: datagram,
            from: "127.0.0.1:40000".parse().expect("addr"),
        }
        .run(&mut ctx)
        .await
        .expect("task");

        let records = store.handle().gossip_records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.origin, "127.0.0.1:9534");
        assert_eq!(receive(&upstream).await, Message::FailoverAck(FailoverAck { id: 42 }));
    }

    #[tokio::test]
    async fn test_flush_with_empty_outbox_sends_nothing() {
        let store = Store::in_memory();
        let mut ctx = context(&store, true, 9);

        RelayTask::Flush.run(&mut ctx).await.expect("flush");

        let stats = ctx.shared.stats.snapshot();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.sent, 0);
        assert!(!ctx.shared.flush_running.load(Ordering::Acquire));
    }
}
