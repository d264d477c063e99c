//! Datagram and payload collaborators
//!
//! Sessions hand finished datagrams to a [`DatagramSender`] and playable
//! payloads to a [`PayloadSink`]. The channel implementations connect a
//! session to the endpoint's socket task and to the application.

use super::rtp::RtpPacket;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::warn;

/// Outbound datagram collaborator
#[cfg_attr(test, mockall::automock)]
pub trait DatagramSender {
    fn send(&mut self, datagram: Bytes, destination: SocketAddr);
}

/// Application side of a session
#[cfg_attr(test, mockall::automock)]
pub trait PayloadSink {
    /// Hand a received payload to the application
    fn deliver(&mut self, payload: Bytes, source: SocketAddr, initiator: bool);

    /// Whether `packet` closes a talkspurt. Only asked when the jitter buffer is on.
    fn is_end_of_talkspurt(&self, _packet: &RtpPacket) -> bool {
        false
    }
}

/// A datagram queued for the socket task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDatagram {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Sender backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<OutboundDatagram>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::UnboundedSender<OutboundDatagram>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundDatagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DatagramSender for ChannelSender {
    fn send(&mut self, datagram: Bytes, destination: SocketAddr) {
        let outbound = OutboundDatagram {
            data: datagram,
            destination,
        };
        if self.tx.send(outbound).is_err() {
            warn!("Socket task gone, dropping datagram to {}", destination);
        }
    }
}

/// A payload handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Bytes,
    pub source: SocketAddr,
    pub initiator: bool,
}

/// Sink backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PayloadSink for ChannelSink {
    fn deliver(&mut self, payload: Bytes, source: SocketAddr, initiator: bool) {
        let delivery = Delivery {
            payload,
            source,
            initiator,
        };
        if self.tx.send(delivery).is_err() {
            warn!("Application receiver gone, dropping payload from {}", source);
        }
    }
}
