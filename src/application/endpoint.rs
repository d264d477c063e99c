//! UDP endpoint
//!
//! Owns the RTP and RTCP sockets of one local port pair and drives the
//! session table from a single task: inbound datagrams, due timers,
//! outbound datagrams and application commands are multiplexed in one
//! `select!` loop, so sessions never need locking.

use crate::config::EngineConfig;
use crate::domain::shared::Result as EngineResult;
use crate::infrastructure::media::rtp::{
    Collaborators, SessionKey, SessionOptions, SessionParams, SessionStats, SessionTable,
};
use crate::infrastructure::media::timer::SharedTimerQueue;
use crate::infrastructure::media::transport::{
    ChannelSender, ChannelSink, Delivery, OutboundDatagram,
};
use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const RECV_BUFFER_SIZE: usize = 2048;
/// Loop wake-up when no timer is pending
const IDLE_WAIT: Duration = Duration::from_secs(1);
/// Attempts to find a consecutive port pair when binding to port 0
const BIND_ATTEMPTS: usize = 16;

/// Wall clock as a duration since the Unix epoch
pub fn clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// RTCP packet types 200..=204 in the second byte. RTP payload types that
/// would alias them (72..=76 with the marker bit) are never sent.
pub fn is_rtcp(datagram: &[u8]) -> bool {
    datagram.len() >= 2 && (200..=204).contains(&datagram[1])
}

/// Requests handled by the endpoint task
pub enum EndpointCommand {
    CreateSession {
        remote: SocketAddr,
        initiator: bool,
        reply: oneshot::Sender<EngineResult<SessionKey>>,
    },
    SendPayload {
        key: SessionKey,
        payload: Bytes,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Terminate {
        key: SessionKey,
        reply: oneshot::Sender<EngineResult<SessionStats>>,
    },
    Stats {
        key: SessionKey,
        reply: oneshot::Sender<EngineResult<SessionStats>>,
    },
    Shutdown,
}

/// Cloneable handle to a running endpoint
#[derive(Clone)]
pub struct EndpointHandle {
    commands: mpsc::UnboundedSender<EndpointCommand>,
    local_rtp: SocketAddr,
}

impl EndpointHandle {
    /// Local RTP address; RTCP is on the next port
    pub fn local_rtp(&self) -> SocketAddr {
        self.local_rtp
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> EndpointCommand,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| anyhow!("endpoint {} is not running", self.local_rtp))?;
        let result = rx.await.context("endpoint dropped the request")?;
        Ok(result?)
    }

    pub async fn create_session(
        &self,
        remote: SocketAddr,
        initiator: bool,
    ) -> anyhow::Result<SessionKey> {
        self.request(|reply| EndpointCommand::CreateSession {
            remote,
            initiator,
            reply,
        })
        .await
    }

    pub async fn send_payload(&self, key: SessionKey, payload: Bytes) -> anyhow::Result<()> {
        self.request(|reply| EndpointCommand::SendPayload {
            key,
            payload,
            reply,
        })
        .await
    }

    /// Terminate a session and return its final statistics
    pub async fn terminate(&self, key: SessionKey) -> anyhow::Result<SessionStats> {
        self.request(|reply| EndpointCommand::Terminate { key, reply })
            .await
    }

    pub async fn stats(&self, key: SessionKey) -> anyhow::Result<SessionStats> {
        self.request(|reply| EndpointCommand::Stats { key, reply }).await
    }

    /// Ask the endpoint to terminate every session and stop
    pub fn shutdown(&self) {
        if self.commands.send(EndpointCommand::Shutdown).is_err() {
            debug!("Endpoint {} already stopped", self.local_rtp);
        }
    }
}

/// RTP/RTCP endpoint
pub struct Endpoint {
    config: EngineConfig,
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    local_rtp: SocketAddr,
    table: SessionTable,
    timers: SharedTimerQueue,
    sender: ChannelSender,
    outbound: mpsc::UnboundedReceiver<OutboundDatagram>,
    sink: ChannelSink,
    commands: mpsc::UnboundedReceiver<EndpointCommand>,
}

impl Endpoint {
    /// Bind the socket pair described by `config.endpoint`.
    ///
    /// Returns the endpoint, a handle to control it once running, and the
    /// receiver of delivered payloads.
    pub async fn bind(
        config: EngineConfig,
    ) -> anyhow::Result<(Self, EndpointHandle, mpsc::UnboundedReceiver<Delivery>)> {
        let (rtp_socket, rtcp_socket) =
            bind_pair(config.endpoint.bind_address, config.endpoint.rtp_port).await?;
        let local_rtp = rtp_socket.local_addr()?;
        info!(
            "RTP socket bound to {}, RTCP socket bound to {}",
            local_rtp,
            rtcp_socket.local_addr()?
        );

        let (sender, outbound) = ChannelSender::channel();
        let (sink, deliveries) = ChannelSink::channel();
        let (command_tx, commands) = mpsc::unbounded_channel();

        let endpoint = Self {
            config,
            rtp_socket,
            rtcp_socket,
            local_rtp,
            table: SessionTable::new(),
            timers: SharedTimerQueue::new(),
            sender,
            outbound,
            sink,
            commands,
        };
        let handle = EndpointHandle {
            commands: command_tx,
            local_rtp,
        };
        Ok((endpoint, handle, deliveries))
    }

    pub fn local_rtp(&self) -> SocketAddr {
        self.local_rtp
    }

    /// Serve until shutdown is requested or every handle is dropped
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut rtp_buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut rtcp_buf = vec![0u8; RECV_BUFFER_SIZE];
        info!("Endpoint {} running", self.local_rtp);

        loop {
            let wait = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_sub(clock()))
                .unwrap_or(IDLE_WAIT);

            tokio::select! {
                received = self.rtp_socket.recv_from(&mut rtp_buf) => match received {
                    Ok((len, source)) => self.on_rtp(&rtp_buf[..len], source),
                    Err(e) => warn!("RTP recv error: {}", e),
                },
                received = self.rtcp_socket.recv_from(&mut rtcp_buf) => match received {
                    Ok((len, source)) => self.on_rtcp(&rtcp_buf[..len], source),
                    Err(e) => warn!("RTCP recv error: {}", e),
                },
                _ = tokio::time::sleep(wait) => self.fire_timers(),
                Some(outbound) = self.outbound.recv() => {
                    transmit(&self.rtp_socket, &self.rtcp_socket, outbound).await
                }
                command = self.commands.recv() => match command {
                    Some(EndpointCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
            }

            self.purge();
        }

        self.stop().await;
        Ok(())
    }

    fn on_rtp(&mut self, datagram: &[u8], source: SocketAddr) {
        match self
            .table
            .dispatch_rtp(self.local_rtp.port(), datagram, source, clock())
        {
            Ok(reception) => trace!("RTP from {}: {:?}", source, reception),
            Err(e) => debug!("Dropping RTP from {}: {}", source, e),
        }
    }

    fn on_rtcp(&mut self, datagram: &[u8], source: SocketAddr) {
        if let Err(e) = self
            .table
            .dispatch_rtcp(self.local_rtp.port(), datagram, source, clock())
        {
            debug!("Dropping RTCP from {}: {}", source, e);
        }
    }

    fn fire_timers(&mut self) {
        let now = clock();
        for timer in self.timers.pop_due(now) {
            if let Err(e) = self.table.dispatch_timer(&timer, now) {
                warn!("{:?} timer for {} failed: {}", timer.kind, timer.key, e);
            }
        }
    }

    fn handle(&mut self, command: EndpointCommand) {
        let now = clock();
        // A dropped reply means the caller gave up waiting
        match command {
            EndpointCommand::CreateSession {
                remote,
                initiator,
                reply,
            } => {
                let params = SessionParams {
                    local: self.local_rtp,
                    remote,
                    payload_type: self.config.rtp.payload_type,
                    packetization: self.config.packetization(),
                    initiator,
                };
                let options = SessionOptions::from_config(&self.config, params.packetization);
                let collaborators = Collaborators {
                    sender: Box::new(self.sender.clone()),
                    sink: Box::new(self.sink.clone()),
                    timers: Box::new(self.timers.clone()),
                };
                let _ = reply.send(self.table.create(params, options, collaborators, now));
            }
            EndpointCommand::SendPayload {
                key,
                payload,
                reply,
            } => {
                let result = self
                    .table
                    .active_mut(key)
                    .and_then(|session| session.send_payload(payload, now, now));
                let _ = reply.send(result);
            }
            EndpointCommand::Terminate { key, reply } => {
                let result = self
                    .table
                    .terminate(key, now)
                    .and_then(|()| self.table.stats(key));
                let _ = reply.send(result);
            }
            EndpointCommand::Stats { key, reply } => {
                let _ = reply.send(self.table.stats(key));
            }
            EndpointCommand::Shutdown => {}
        }
    }

    /// Drop closed sessions and their pending timers
    fn purge(&mut self) {
        for (key, _) in self.table.purge_inactive() {
            let cancelled = self.timers.cancel_session(key);
            debug!("Purged session {} ({} timers cancelled)", key, cancelled);
        }
    }

    async fn stop(&mut self) {
        let now = clock();
        let keys: Vec<SessionKey> = self.table.keys().copied().collect();
        for key in keys {
            if self.table.get(key).is_some_and(|s| s.is_active()) {
                if let Err(e) = self.table.terminate(key, now) {
                    warn!("Failed to terminate {}: {}", key, e);
                }
            }
        }
        while let Ok(outbound) = self.outbound.try_recv() {
            transmit(&self.rtp_socket, &self.rtcp_socket, outbound).await;
        }
        self.purge();
        info!("Endpoint {} stopped", self.local_rtp);
    }
}

/// Send on the socket matching the datagram's protocol
async fn transmit(rtp: &UdpSocket, rtcp: &UdpSocket, outbound: OutboundDatagram) {
    let socket = if is_rtcp(&outbound.data) { rtcp } else { rtp };
    if let Err(e) = socket.send_to(&outbound.data, outbound.destination).await {
        warn!(
            "Failed to send {} bytes to {}: {}",
            outbound.data.len(),
            outbound.destination,
            e
        );
    }
}

/// Bind RTP on `port` and RTCP on `port + 1`. Port 0 picks a free pair.
async fn bind_pair(ip: IpAddr, port: u16) -> anyhow::Result<(UdpSocket, UdpSocket)> {
    if port != 0 {
        let rtcp_port = port
            .checked_add(1)
            .ok_or_else(|| anyhow!("RTP port {} leaves no room for RTCP", port))?;
        let rtp = UdpSocket::bind(SocketAddr::new(ip, port))
            .await
            .with_context(|| format!("binding RTP socket on {}:{}", ip, port))?;
        let rtcp = UdpSocket::bind(SocketAddr::new(ip, rtcp_port))
            .await
            .with_context(|| format!("binding RTCP socket on {}:{}", ip, rtcp_port))?;
        return Ok((rtp, rtcp));
    }

    for _ in 0..BIND_ATTEMPTS {
        let rtp = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let Some(rtcp_port) = rtp.local_addr()?.port().checked_add(1) else {
            continue;
        };
        if let Ok(rtcp) = UdpSocket::bind(SocketAddr::new(ip, rtcp_port)).await {
            return Ok((rtp, rtcp));
        }
    }
    bail!("no free RTP/RTCP port pair on {} after {} attempts", ip, BIND_ATTEMPTS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    fn loopback_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.endpoint.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.endpoint.rtp_port = 0;
        config.rtp.statistics = false;
        config
    }

    #[test]
    fn test_is_rtcp() {
        assert!(is_rtcp(&[0x80, 200, 0, 6]));
        assert!(is_rtcp(&[0x81, 203, 0, 1]));
        assert!(!is_rtcp(&[0x80, 0, 0, 1]));
        // Marker bit with payload type 8
        assert!(!is_rtcp(&[0x80, 0x88, 0, 1]));
        assert!(!is_rtcp(&[0x80]));
    }

    #[tokio::test]
    async fn test_bind_pair_is_consecutive() {
        let (rtp, rtcp) = bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
        assert_eq!(
            rtp.local_addr().unwrap().port() + 1,
            rtcp.local_addr().unwrap().port()
        );
    }

    #[tokio::test]
    async fn test_loopback_session() {
        let (alice, alice_handle, _alice_rx) = Endpoint::bind(loopback_config()).await.unwrap();
        let (bob, bob_handle, mut bob_rx) = Endpoint::bind(loopback_config()).await.unwrap();
        let alice_task = tokio::spawn(alice.run());
        let bob_task = tokio::spawn(bob.run());

        let to_bob = alice_handle
            .create_session(bob_handle.local_rtp(), true)
            .await
            .unwrap();
        let to_alice = bob_handle
            .create_session(alice_handle.local_rtp(), false)
            .await
            .unwrap();

        for i in 0..5u8 {
            alice_handle
                .send_payload(to_bob, Bytes::from(vec![i; 160]))
                .await
                .unwrap();
        }

        // The first packet is absorbed by probation
        let mut delivered = Vec::new();
        while delivered.len() < 4 {
            let delivery = timeout(Duration::from_secs(2), bob_rx.recv())
                .await
                .expect("payload not delivered in time")
                .unwrap();
            assert_eq!(delivery.source.ip(), alice_handle.local_rtp().ip());
            assert!(!delivery.initiator);
            delivered.push(delivery.payload[0]);
        }
        assert_eq!(delivered, vec![1, 2, 3, 4]);

        let stats = bob_handle.stats(to_alice).await.unwrap();
        assert_eq!(stats.rtp.packets_received, 4);
        assert_eq!(stats.rtp.probation_dropped, 1);

        let final_stats = alice_handle.terminate(to_bob).await.unwrap();
        assert!(!final_stats.active);
        assert_eq!(final_stats.rtp.packets_sent, 5);
        assert!(alice_handle.stats(to_bob).await.is_err());

        alice_handle.shutdown();
        bob_handle.shutdown();
        alice_task.await.unwrap().unwrap();
        bob_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let (endpoint, handle, _rx) = Endpoint::bind(loopback_config()).await.unwrap();
        let task = tokio::spawn(endpoint.run());
        handle.shutdown();
        task.await.unwrap().unwrap();

        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(handle.create_session(remote, true).await.is_err());
    }
}
