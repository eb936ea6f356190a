//! One feeder connection, end to end.
//!
//! classify → name/geolocate → register → connect upstream → relay both
//! directions → teardown. The session lasts until both directions have
//! finished. The inbound loop is the only writer of the session's counters.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;

use beast_core::{count_frames, Origin};
use beast_services::{
    ConnectionId, FeederId, FeederStore, GeoLocator, LiveSession, NewFeeder, OriginClassifier,
    SessionId, SessionMeta, SessionStats, SessionTable, StatsRecorder,
};

/// Read size for both copy directions.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Everything a session needs besides its own sockets.
pub struct RelayContext {
    pub sessions: SessionTable,
    pub classifier: Arc<OriginClassifier>,
    pub store: Arc<dyn FeederStore>,
    pub geo: Arc<dyn GeoLocator>,
    /// `host:port` of the aggregator's Beast input.
    pub upstream: String,
    pub connect_timeout: Duration,
}

/// Store handles for a registered session.
#[derive(Debug, Clone, Copy)]
struct Registration {
    feeder_id: FeederId,
    connection_id: ConnectionId,
}

pub struct Session {
    id: SessionId,
    ctx: Arc<RelayContext>,
    shutdown: broadcast::Receiver<()>,
}

impl Session {
    pub fn new(id: SessionId, ctx: Arc<RelayContext>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { id, ctx, shutdown }
    }

    pub async fn run(mut self, mut client: TcpStream) {
        let peer_addr = match client.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "cannot determine peer address, closing");
                let _ = client.shutdown().await;
                return;
            }
        };
        let ip = peer_addr.ip().to_canonical();

        let origin = self.ctx.classifier.classify(ip).await;
        let feeder = self.identify(ip, origin).await;
        let label = feeder.hostname.clone().or_else(|| feeder.location.clone());
        tracing::info!(
            session = self.id,
            addr = %peer_addr,
            origin = %origin,
            label = label.as_deref().unwrap_or("unknown"),
            "feeder connected"
        );

        let (stats, mut recorder) = SessionStats::new();
        let registration = self.register(&feeder, ip).await;
        if let Some(reg) = registration {
            self.ctx.sessions.insert(
                self.id,
                LiveSession {
                    meta: SessionMeta {
                        feeder_id: reg.feeder_id,
                        connection_id: reg.connection_id,
                        peer_addr,
                        origin,
                        label,
                        connected_at: Instant::now(),
                    },
                    stats: stats.clone(),
                },
            );
        }

        let upstream = self.connect_upstream(peer_addr).await;
        if let Some(mut upstream) = upstream {
            self.relay(&mut client, &mut upstream, &mut recorder, peer_addr)
                .await;
            shutdown_quietly(&mut upstream).await;
        }
        shutdown_quietly(&mut client).await;

        self.teardown(registration, &stats, peer_addr).await;
    }

    /// Overlay peers are named by their network; public feeders are
    /// geolocated. Never both.
    async fn identify(&self, ip: IpAddr, origin: Origin) -> NewFeeder {
        let mut feeder = NewFeeder::new(ip, origin);
        if origin.is_overlay() {
            feeder.hostname = self.ctx.classifier.resolve_name(ip, origin).await;
        } else if let Some(geo) = self.ctx.geo.lookup(ip) {
            feeder.location = geo.location;
            feeder.latitude = geo.latitude;
            feeder.longitude = geo.longitude;
        }
        feeder
    }

    async fn register(&self, feeder: &NewFeeder, ip: IpAddr) -> Option<Registration> {
        let result = async {
            let feeder_id = self.ctx.store.upsert_feeder(feeder).await?;
            let connection_id = self.ctx.store.log_connection(feeder_id, ip).await?;
            anyhow::Ok(Registration {
                feeder_id,
                connection_id,
            })
        }
        .await;
        match result {
            Ok(reg) => {
                tracing::debug!(
                    session = self.id,
                    feeder_id = reg.feeder_id,
                    connection_id = reg.connection_id,
                    "session registered"
                );
                Some(reg)
            }
            Err(e) => {
                tracing::warn!(
                    session = self.id,
                    addr = %ip,
                    error = %e,
                    "store registration failed, relaying untracked"
                );
                None
            }
        }
    }

    async fn connect_upstream(&mut self, peer_addr: SocketAddr) -> Option<TcpStream> {
        let connect = tokio::time::timeout(
            self.ctx.connect_timeout,
            TcpStream::connect(&self.ctx.upstream),
        );
        tokio::select! {
            _ = self.shutdown.recv() => {
                tracing::debug!(session = self.id, "shutdown during upstream connect");
                None
            }
            result = connect => match result {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    Some(stream)
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        session = self.id,
                        addr = %peer_addr,
                        upstream = %self.ctx.upstream,
                        error = %e,
                        "upstream connect failed"
                    );
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        session = self.id,
                        addr = %peer_addr,
                        upstream = %self.ctx.upstream,
                        "upstream connect timed out"
                    );
                    None
                }
            },
        }
    }

    /// Runs until both directions have ended or shutdown fires. Each
    /// direction passes its EOF on by shutting down the write side it feeds.
    async fn relay(
        &mut self,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
        recorder: &mut StatsRecorder,
        peer_addr: SocketAddr,
    ) {
        let (mut client_rd, mut client_wr) = client.split();
        let (mut upstream_rd, mut upstream_wr) = upstream.split();

        let inbound = async {
            let result = copy_inbound(&mut client_rd, &mut upstream_wr, recorder).await;
            let _ = upstream_wr.shutdown().await;
            result
        };
        let outbound = async {
            let result = copy_plain(&mut upstream_rd, &mut client_wr).await;
            let _ = client_wr.shutdown().await;
            result
        };

        let finished = tokio::select! {
            results = async { tokio::join!(inbound, outbound) } => Some(results),
            _ = self.shutdown.recv() => None,
        };

        match finished {
            Some((inbound, outbound)) => {
                self.log_direction("inbound", inbound, peer_addr);
                self.log_direction("outbound", outbound, peer_addr);
            }
            None => {
                tracing::debug!(session = self.id, addr = %peer_addr, "relay stopped by shutdown");
            }
        }
    }

    fn log_direction(&self, direction: &'static str, result: io::Result<()>, peer_addr: SocketAddr) {
        match result {
            Ok(()) => {
                tracing::debug!(session = self.id, addr = %peer_addr, direction, "relay direction ended");
            }
            Err(e) if is_transient(&e) => {
                tracing::debug!(session = self.id, addr = %peer_addr, direction, error = %e, "peer went away");
            }
            Err(e) => {
                tracing::warn!(session = self.id, addr = %peer_addr, direction, error = %e, "relay error");
            }
        }
    }

    async fn teardown(&self, registration: Option<Registration>, stats: &SessionStats, peer_addr: SocketAddr) {
        let Some(reg) = registration else {
            tracing::info!(session = self.id, addr = %peer_addr, "untracked feeder disconnected");
            return;
        };

        // Out of the table first, so the reconciler stops touching this
        // feeder before it is marked offline.
        self.ctx.sessions.remove(&self.id);

        let delta = stats.take_unflushed();
        if !delta.is_zero() {
            if let Err(e) = self.ctx.store.add_counters(reg.feeder_id, delta).await {
                stats.restore(delta);
                tracing::warn!(feeder_id = reg.feeder_id, error = %e, "final counter flush failed");
            }
        }

        let totals = stats.totals();
        match self
            .ctx
            .store
            .log_disconnection(reg.feeder_id, reg.connection_id, totals.bytes)
            .await
        {
            Ok(duration_secs) => tracing::info!(
                session = self.id,
                feeder_id = reg.feeder_id,
                addr = %peer_addr,
                bytes = totals.bytes,
                messages = totals.messages,
                positions = totals.positions,
                duration_secs,
                "feeder disconnected"
            ),
            Err(e) => tracing::warn!(
                session = self.id,
                feeder_id = reg.feeder_id,
                error = %e,
                "failed to record disconnect"
            ),
        }
    }
}

/// Client → upstream, counting frames in every chunk before forwarding it.
async fn copy_inbound<R, W>(reader: &mut R, writer: &mut W, recorder: &mut StatsRecorder) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let frames = count_frames(&buf);
        writer.write_all(&buf).await?;
        recorder.record(n, frames);
    }
}

/// Upstream → client, forwarded untouched.
async fn copy_plain<R, W>(reader: &mut R, writer: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf).await?;
    }
}

/// Errors that are just a peer hanging up.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

async fn shutdown_quietly(stream: &mut TcpStream) {
    if let Err(e) = stream.shutdown().await {
        if e.kind() != io::ErrorKind::NotConnected {
            tracing::debug!(error = %e, "socket shutdown failed");
        }
    }
}
