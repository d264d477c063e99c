//! RTP Session Management
//!
//! A [`Session`] ties one bidirectional media flow together: outgoing RTP,
//! incoming RTP through sequence validation and the optional jitter buffer,
//! RTCP reports on the randomized schedule, and the BYE exchange. All handlers
//! are synchronous and take the current time (since the Unix epoch) explicitly.

use super::history::{round_trip, ReportHistory, RttStats};
use super::jitter_buffer::{BufferedPacket, JitterBuffer, JitterBufferConfig};
use super::ntp::NtpTimestamp;
use super::packet::RtpPacket;
use super::reporter::{report_blocks, SdesRotation};
use super::rtcp::{
    CompoundBuilder, CompoundPacket, Goodbye, ReceiverReport, ReportBlock, RtcpPacket,
    SdesItemType, SenderReport, SourceDescription, MAX_REPORT_BLOCKS,
};
use super::scheduler::{Membership, RtcpScheduler, SendDecision};
use super::sequence::SequenceCheck;
use super::source::{LastSenderReport, SourceDatabase};
use super::stats::{RtcpCounters, RtpCounters, SessionStats};
use super::table::SessionKey;
use crate::config::{EngineConfig, SdesConfig};
use crate::domain::shared::{EngineError, Result};
use crate::infrastructure::media::timer::{FiredTimer, TimerHandle, TimerKind, TimerService};
use crate::infrastructure::media::transport::{DatagramSender, PayloadSink};
use crate::infrastructure::metrics;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Housekeeping runs at most this often, and the RTCP check at least this often
pub const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

/// Addresses and media parameters of a new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Local RTP address
    pub local: SocketAddr,
    /// Remote RTP address
    pub remote: SocketAddr,
    pub payload_type: u8,
    pub packetization: Duration,
    /// This side initiated the session
    pub initiator: bool,
}

/// Engine settings applied to one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub session_bandwidth: f64,
    pub jitter_buffer: Option<JitterBufferConfig>,
    pub sdes: SdesConfig,
    pub statistics: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default(), Duration::from_millis(20))
    }
}

impl SessionOptions {
    pub fn from_config(config: &EngineConfig, packetization: Duration) -> Self {
        Self {
            session_bandwidth: config.rtp.session_bandwidth,
            jitter_buffer: config.jitter_buffer_config(packetization),
            sdes: config.sdes.clone(),
            statistics: config.rtp.statistics,
        }
    }
}

/// Collaborators a session calls out to
pub struct Collaborators {
    pub sender: Box<dyn DatagramSender + Send>,
    pub sink: Box<dyn PayloadSink + Send>,
    pub timers: Box<dyn TimerService + Send>,
}

/// What happened to an inbound RTP datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    /// Handed to the application
    Delivered,
    /// Held by the jitter buffer
    Buffered,
    /// Source still on probation
    Probation,
    /// Duplicate, stale or too late
    Discarded,
    /// Failed validation
    Invalid,
}

/// RTP Session
pub struct Session {
    key: SessionKey,
    local: SocketAddr,
    remote: SocketAddr,
    remote_rtcp: SocketAddr,
    payload_type: u8,
    packetization: Duration,
    initiator: bool,
    active: bool,
    own_ssrc: u32,
    remote_ssrc: Option<u32>,
    /// Next outgoing sequence number
    sequence: u16,
    counters: RtpCounters,
    rtcp_counters: RtcpCounters,
    last_rtp_send: Duration,
    sent_report: bool,
    sources: SourceDatabase,
    history: ReportHistory,
    rtt: RttStats,
    scheduler: RtcpScheduler,
    sdes_rotation: SdesRotation,
    jitter_buffer: Option<JitterBuffer>,
    rtcp_timer: Option<TimerHandle>,
    last_housekeeping: Duration,
    statistics: bool,
    rng: StdRng,
    sender: Box<dyn DatagramSender + Send>,
    sink: Box<dyn PayloadSink + Send>,
    timers: Box<dyn TimerService + Send>,
}

impl Session {
    /// Create a session and arm its first RTCP check
    pub fn new(
        params: SessionParams,
        options: SessionOptions,
        collaborators: Collaborators,
        now: Duration,
    ) -> Result<Self> {
        params.local.port().checked_add(1).ok_or_else(|| {
            EngineError::InvalidOperation(format!("no RTCP port above local port {}", params.local.port()))
        })?;
        let remote_rtcp_port = params.remote.port().checked_add(1).ok_or_else(|| {
            EngineError::InvalidOperation(format!(
                "no RTCP port above remote port {}",
                params.remote.port()
            ))
        })?;
        if params.payload_type > 127 {
            return Err(EngineError::InvalidOperation(format!(
                "payload type {} does not fit in 7 bits",
                params.payload_type
            )));
        }

        let mut rng = StdRng::from_entropy();
        let own_ssrc = loop {
            let ssrc: u32 = rng.gen();
            if ssrc != 0 {
                break ssrc;
            }
        };

        let mut sources = SourceDatabase::new(own_ssrc, now);
        let own = sources
            .get_mut(own_ssrc)
            .ok_or_else(|| EngineError::InvalidOperation("own source missing".to_string()))?;
        fill_own_sdes(&mut own.sdes, &options.sdes, &params);

        let jitter_buffer = options.jitter_buffer.map(|mut config| {
            config.nominal_delay = params.packetization;
            JitterBuffer::new(config)
        });

        let mut session = Self {
            key: SessionKey::new(params.remote.ip(), params.local.port()),
            local: params.local,
            remote: params.remote,
            remote_rtcp: SocketAddr::new(params.remote.ip(), remote_rtcp_port),
            payload_type: params.payload_type,
            packetization: params.packetization,
            initiator: params.initiator,
            active: true,
            own_ssrc,
            remote_ssrc: None,
            sequence: rng.gen(),
            counters: RtpCounters::default(),
            rtcp_counters: RtcpCounters::default(),
            last_rtp_send: now,
            sent_report: false,
            sources,
            history: ReportHistory::new(),
            rtt: RttStats::default(),
            scheduler: RtcpScheduler::new(options.session_bandwidth),
            sdes_rotation: SdesRotation::new(),
            jitter_buffer,
            rtcp_timer: None,
            last_housekeeping: now,
            statistics: options.statistics,
            rng,
            sender: collaborators.sender,
            sink: collaborators.sink,
            timers: collaborators.timers,
        };

        let membership = session.membership();
        session.scheduler.start(now, membership, &mut session.rng);
        session.arm_rtcp_timer(now);

        info!(
            "Session {} created: ssrc={:08x}, local={}, remote={}, pt={}",
            session.key, own_ssrc, session.local, session.remote, session.payload_type
        );
        Ok(session)
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn own_ssrc(&self) -> u32 {
        self.own_ssrc
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.remote_ssrc
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_rtcp(&self) -> SocketAddr {
        self.remote_rtcp
    }

    pub fn packetization(&self) -> Duration {
        self.packetization
    }

    pub fn counters(&self) -> &RtpCounters {
        &self.counters
    }

    pub fn rtcp_counters(&self) -> &RtcpCounters {
        &self.rtcp_counters
    }

    pub fn sources(&self) -> &SourceDatabase {
        &self.sources
    }

    pub fn history(&self) -> &ReportHistory {
        &self.history
    }

    pub fn rtt(&self) -> &RttStats {
        &self.rtt
    }

    pub fn scheduler(&self) -> &RtcpScheduler {
        &self.scheduler
    }

    pub fn jitter_buffer(&self) -> Option<&JitterBuffer> {
        self.jitter_buffer.as_ref()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            return Ok(());
        }
        Err(EngineError::SessionInactive {
            remote: self.key.remote,
            local_port: self.key.local_port,
        })
    }

    /// Members exclude sources that already said goodbye
    fn membership(&self) -> Membership {
        Membership {
            members: self.sources.iter().filter(|s| !s.got_bye()).count(),
            senders: self.sources.senders() + self.scheduler.we_sent as usize,
        }
    }

    /// Packetize and send an application payload sampled at `sampled_at`
    pub fn send_payload(&mut self, payload: Bytes, sampled_at: Duration, now: Duration) -> Result<()> {
        self.ensure_active()?;

        let mut packet = RtpPacket::new(
            self.payload_type,
            self.sequence,
            sampled_at.as_millis() as u32,
            self.own_ssrc,
            payload,
        );
        packet.set_marker(self.counters.packets_sent == 0);
        self.sequence = self.sequence.wrapping_add(1);

        self.counters.packets_sent = self.counters.packets_sent.wrapping_add(1);
        self.counters.bytes_sent = self.counters.bytes_sent.wrapping_add(packet.size() as u32);
        self.last_rtp_send = now;
        self.scheduler.we_sent = true;

        trace!("Sending {} to {}", packet, self.remote);
        self.sender.send(packet.serialize(), self.remote);
        metrics::record_rtp_sent();
        Ok(())
    }

    /// Handle an RTP datagram received from `source`
    pub fn on_rtp(&mut self, datagram: &[u8], source: SocketAddr, now: Duration) -> Result<Reception> {
        self.ensure_active()?;

        let packet = match RtpPacket::parse(datagram)
            .and_then(|p| p.check_payload_type(self.payload_type).map(|_| p))
        {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Discarding invalid RTP from {}: {}", source, e);
                self.counters.invalid += 1;
                metrics::record_rtp_invalid();
                return Ok(Reception::Invalid);
            }
        };
        if packet.ssrc == self.own_ssrc {
            warn!("RTP from {} carries our own SSRC {:08x}", source, self.own_ssrc);
            self.counters.invalid += 1;
            metrics::record_rtp_invalid();
            return Ok(Reception::Invalid);
        }

        let check = {
            let (entry, created) = self.sources.get_or_create(packet.ssrc, now, true);
            if created {
                info!("Session {}: new source {:08x} from {}", self.key, packet.ssrc, source);
            }
            entry.prime_sequence(packet.sequence);
            let check = entry.sequence.validate(packet.sequence);
            if check.is_accepted() {
                entry.is_sender = true;
                entry.update_jitter(now.as_millis() as u32, packet.timestamp);
            }
            check
        };

        match check {
            SequenceCheck::Probationary => {
                self.counters.probation_dropped += 1;
                metrics::record_probation_drop();
                trace!("Source {:08x} on probation, seq={}", packet.ssrc, packet.sequence);
                return Ok(Reception::Probation);
            }
            // Reordered or duplicate: the jitter buffer sorts it out or rejects it
            SequenceCheck::Discarded if self.jitter_buffer.is_some() => {
                trace!("Buffering out-of-order seq={} from {:08x}", packet.sequence, packet.ssrc);
            }
            SequenceCheck::Discarded => {
                self.counters.discarded += 1;
                debug!("Discarding stale seq={} from {:08x}", packet.sequence, packet.ssrc);
                return Ok(Reception::Discarded);
            }
            SequenceCheck::Accepted | SequenceCheck::AcceptedResync => {}
        }

        self.counters.packets_received = self.counters.packets_received.wrapping_add(1);
        self.counters.bytes_received = self
            .counters
            .bytes_received
            .wrapping_add(packet.size() as u32);
        self.remote_ssrc = Some(packet.ssrc);
        metrics::record_rtp_received();

        let end_of_spurt = self.jitter_buffer.is_some() && self.sink.is_end_of_talkspurt(&packet);
        let buffered = BufferedPacket {
            packet,
            source,
            arrived: now,
            end_of_spurt,
        };

        let Some(jitter_buffer) = self.jitter_buffer.as_mut() else {
            self.play(buffered, now);
            return Ok(Reception::Delivered);
        };

        jitter_buffer.observe_transit(now, buffered.packet.timestamp);
        let insertion = jitter_buffer.insert(buffered);
        if insertion.start_timers {
            self.arm_jitter_timers(now);
        }
        if let Some(released) = insertion.released {
            self.play(released, now);
        }

        if insertion.stored {
            Ok(Reception::Buffered)
        } else {
            self.counters.discarded += 1;
            Ok(Reception::Discarded)
        }
    }

    /// Hand a packet to the application
    fn play(&mut self, buffered: BufferedPacket, now: Duration) {
        let delay = (now.as_millis() as u32).wrapping_sub(buffered.packet.timestamp) as i32;
        self.counters.total_e2e_delay_ms += delay.max(0) as u64;
        self.counters.packets_delivered += 1;

        self.sink
            .deliver(buffered.packet.payload, buffered.source, self.initiator);
    }

    /// Handle an RTCP datagram received from `source`
    pub fn on_rtcp(&mut self, datagram: &[u8], source: SocketAddr, now: Duration) -> Result<()> {
        self.ensure_active()?;

        let compound = match CompoundPacket::decode(datagram) {
            Ok(compound) => compound,
            Err(e) => {
                warn!("Discarding invalid RTCP from {}: {}", source, e);
                self.rtcp_counters.invalid += 1;
                metrics::record_rtcp_invalid();
                return Ok(());
            }
        };

        self.rtcp_counters.compound_received += 1;
        self.scheduler.record_packet_size(datagram.len());

        let mut got_bye = false;
        for packet in compound.packets {
            let packet_type = packet.packet_type();
            self.rtcp_counters.count_received(packet_type);
            metrics::record_rtcp_received(packet_type.as_str());

            match packet {
                RtcpPacket::SenderReport(sr) => {
                    if sr.ssrc == self.own_ssrc {
                        warn!("SR from {} carries our own SSRC", source);
                        continue;
                    }
                    let entry = self.source_from_rtcp(sr.ssrc, now, source);
                    entry.is_sender = true;
                    entry.last_sr = Some(LastSenderReport {
                        ntp: sr.ntp,
                        received_at: now,
                    });
                    debug!(
                        "SR from {:08x}: packets={}, octets={}",
                        sr.ssrc, sr.packet_count, sr.octet_count
                    );
                    self.process_report_blocks(sr.ssrc, &sr.reports, now);
                }
                RtcpPacket::ReceiverReport(rr) => {
                    if rr.ssrc == self.own_ssrc {
                        warn!("RR from {} carries our own SSRC", source);
                        continue;
                    }
                    self.source_from_rtcp(rr.ssrc, now, source);
                    self.process_report_blocks(rr.ssrc, &rr.reports, now);
                }
                RtcpPacket::SourceDescription(sdes) => {
                    for chunk in sdes.chunks {
                        if chunk.ssrc == self.own_ssrc {
                            continue;
                        }
                        let entry = self.source_from_rtcp(chunk.ssrc, now, source);
                        for item in chunk.items {
                            if item.kind != SdesItemType::End {
                                entry.sdes.insert(item.kind, item.text);
                            }
                        }
                    }
                }
                RtcpPacket::Goodbye(bye) => {
                    for ssrc in bye.sources {
                        if ssrc == self.own_ssrc {
                            continue;
                        }
                        if let Some(entry) = self.sources.get_mut(ssrc) {
                            if entry.bye_at.is_none() {
                                entry.bye_at = Some(now);
                                self.scheduler.bye_count_received += 1;
                            }
                        }
                        info!(
                            "Session {}: BYE from {:08x} ({})",
                            self.key,
                            ssrc,
                            bye.reason.as_deref().unwrap_or("no reason")
                        );
                        got_bye = true;
                    }
                }
            }
        }

        if got_bye {
            let members = self.membership().members;
            self.scheduler.reverse_reconsider(now, members);
            self.close(now);
        }
        Ok(())
    }

    fn source_from_rtcp(
        &mut self,
        ssrc: u32,
        now: Duration,
        source: SocketAddr,
    ) -> &mut super::source::SourceEntry {
        let (entry, created) = self.sources.get_or_create(ssrc, now, false);
        if created {
            info!("Session {}: new source {:08x} from RTCP {}", self.key, ssrc, source);
        }
        entry
    }

    fn process_report_blocks(&mut self, reporter: u32, blocks: &[ReportBlock], now: Duration) {
        for block in blocks {
            self.history.insert(reporter, *block, now);

            if block.ssrc != self.own_ssrc {
                let (_, created) = self.sources.get_or_create(block.ssrc, now, false);
                if created {
                    debug!(
                        "Session {}: source {:08x} known from a report by {:08x}",
                        self.key, block.ssrc, reporter
                    );
                }
                continue;
            }
            if let Some(rtt) = round_trip(block, NtpTimestamp::from_unix(now)) {
                self.rtt.record(rtt);
                debug!("RTT to {:08x}: {:?}", reporter, rtt);
            }
        }
    }

    /// Dispatch a fired timer. Timers that were replaced or canceled are ignored.
    pub fn on_timer(&mut self, timer: &FiredTimer, now: Duration) -> Result<()> {
        if !self.active {
            trace!("Ignoring {:?} on inactive session {}", timer.kind, self.key);
            return Ok(());
        }

        match timer.kind {
            TimerKind::RtcpCheck => self.on_rtcp_check(timer.handle, now),
            TimerKind::JitterNominal => self.on_jitter_nominal(timer.handle, now),
            TimerKind::JitterTalkspurt => self.on_jitter_talkspurt(timer.handle, now),
        }
        Ok(())
    }

    fn on_rtcp_check(&mut self, handle: TimerHandle, now: Duration) {
        if self.rtcp_timer != Some(handle) {
            return;
        }
        self.rtcp_timer = None;

        if now.saturating_sub(self.last_housekeeping) >= HOUSEKEEPING_PERIOD {
            self.housekeep(now);
        }

        let membership = self.membership();
        if let SendDecision::Send = self.scheduler.check(now, membership, &mut self.rng) {
            self.send_report(now, false);
            let membership = self.membership();
            self.scheduler.on_sent(now, membership, &mut self.rng);
        }
        self.arm_rtcp_timer(now);
    }

    fn arm_rtcp_timer(&mut self, now: Duration) {
        if let Some(handle) = self.rtcp_timer.take() {
            self.timers.cancel(handle);
        }
        let deadline = self
            .scheduler
            .next_send
            .min(now + HOUSEKEEPING_PERIOD)
            .max(now);
        self.rtcp_timer = Some(self.timers.schedule(self.key, TimerKind::RtcpCheck, deadline));
    }

    fn arm_jitter_timers(&mut self, now: Duration) {
        let Some(jitter_buffer) = self.jitter_buffer.as_mut() else {
            return;
        };
        let config = jitter_buffer.config().clone();

        for handle in [
            jitter_buffer.nominal_timer.take(),
            jitter_buffer.talkspurt_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.timers.cancel(handle);
        }

        jitter_buffer.nominal_timer = Some(self.timers.schedule(
            self.key,
            TimerKind::JitterNominal,
            now + config.nominal_delay,
        ));
        jitter_buffer.talkspurt_timer = Some(self.timers.schedule(
            self.key,
            TimerKind::JitterTalkspurt,
            now + config.talkspurt_delay,
        ));
    }

    fn on_jitter_nominal(&mut self, handle: TimerHandle, now: Duration) {
        let Some(jitter_buffer) = self.jitter_buffer.as_mut() else {
            return;
        };
        if jitter_buffer.nominal_timer != Some(handle) {
            return;
        }
        jitter_buffer.nominal_timer = None;

        let playout = jitter_buffer.on_nominal_timer(now);
        if playout.dropped > 0 {
            metrics::record_jitter_drops(playout.dropped);
        }

        if playout.talkspurt_over {
            if let Some(handle) = jitter_buffer.talkspurt_timer.take() {
                self.timers.cancel(handle);
            }
            debug!("Session {}: talkspurt over", self.key);
        } else {
            let deadline = now + jitter_buffer.config().nominal_delay;
            jitter_buffer.nominal_timer =
                Some(self.timers.schedule(self.key, TimerKind::JitterNominal, deadline));
        }

        if let Some(released) = playout.released {
            self.play(released, now);
        }
    }

    fn on_jitter_talkspurt(&mut self, handle: TimerHandle, now: Duration) {
        let Some(jitter_buffer) = self.jitter_buffer.as_mut() else {
            return;
        };
        if jitter_buffer.talkspurt_timer != Some(handle) {
            return;
        }

        jitter_buffer.on_talkspurt_timer();
        let deadline = now + jitter_buffer.config().talkspurt_delay;
        jitter_buffer.talkspurt_timer =
            Some(self.timers.schedule(self.key, TimerKind::JitterTalkspurt, deadline));
    }

    /// Expire state that timed out and shrink the RTCP schedule if the group did
    fn housekeep(&mut self, now: Duration) {
        self.last_housekeeping = now;
        self.scheduler.expire_we_sent(now, self.last_rtp_send);

        let interval = self.scheduler.current_interval();
        let result = self.sources.housekeep(now, interval);
        for ssrc in &result.removed {
            self.history.remove_source(*ssrc);
            info!("Session {}: source {:08x} removed", self.key, ssrc);
        }
        let purged = self.history.purge(now, interval);
        if purged > 0 || result.demoted > 0 {
            debug!(
                "Session {}: purged {} report(s), demoted {} sender(s)",
                self.key, purged, result.demoted
            );
        }

        let members = self.membership().members;
        self.scheduler.reverse_reconsider(now, members);
    }

    /// Build and send one compound packet, optionally ending with our BYE
    fn send_report(&mut self, now: Duration, bye: bool) {
        let mut blocks = report_blocks(&mut self.sources, now);
        let overflow = blocks.split_off(blocks.len().min(MAX_REPORT_BLOCKS));

        let head = if self.scheduler.we_sent && !bye {
            let mut sr = SenderReport::new(
                self.own_ssrc,
                NtpTimestamp::from_unix(now),
                now.as_millis() as u32,
                self.counters.packets_sent,
                self.counters.bytes_sent,
            );
            sr.reports = blocks;
            RtcpPacket::SenderReport(sr)
        } else {
            let mut rr = ReceiverReport::new(self.own_ssrc);
            rr.reports = blocks;
            RtcpPacket::ReceiverReport(rr)
        };

        let goodbye = bye.then(|| Goodbye::new(self.own_ssrc));
        let reserve = goodbye.as_ref().map_or(0, Goodbye::size);

        let mut builder = CompoundBuilder::new();
        if let Err(e) = builder.push(head) {
            warn!("Session {}: report does not fit: {}", self.key, e);
            return;
        }

        if let Some(own) = self.sources.own() {
            let budget = builder.remaining().saturating_sub(reserve);
            let chunk = self.sdes_rotation.next_chunk(own, budget);
            if let Err(e) = builder.push(RtcpPacket::SourceDescription(SourceDescription::with_chunk(chunk))) {
                warn!("Session {}: SDES does not fit: {}", self.key, e);
            }
        }

        for reports in overflow.chunks(MAX_REPORT_BLOCKS) {
            let mut rr = ReceiverReport::new(self.own_ssrc);
            rr.reports = reports.to_vec();
            if rr.size() + reserve > builder.remaining() {
                debug!("Session {}: dropping {} report block(s) past the size limit", self.key, reports.len());
                break;
            }
            if let Err(e) = builder.push(RtcpPacket::ReceiverReport(rr)) {
                warn!("Session {}: extra report blocks do not fit: {}", self.key, e);
                break;
            }
        }

        if let Some(goodbye) = goodbye {
            if let Err(e) = builder.push(RtcpPacket::Goodbye(goodbye)) {
                warn!("Session {}: BYE does not fit: {}", self.key, e);
            }
        }

        let compound = builder.finish();
        for packet in &compound.packets {
            let packet_type = packet.packet_type();
            self.rtcp_counters.count_sent(packet_type);
            metrics::record_rtcp_sent(packet_type.as_str());
        }
        let data = compound.encode();

        self.rtcp_counters.compound_sent += 1;
        debug!(
            "Session {}: sending RTCP ({} sub-packets, {} bytes) to {}",
            self.key,
            compound.packets.len(),
            data.len(),
            self.remote_rtcp
        );
        self.sender.send(data, self.remote_rtcp);

        self.sources.clear_senders();
        self.sent_report = true;
    }

    /// Leave the session: flush the jitter buffer, cancel timers, say BYE
    pub fn terminate(&mut self, now: Duration) -> Result<()> {
        self.ensure_active()?;
        self.close(now);
        Ok(())
    }

    fn close(&mut self, now: Duration) {
        if let Some(jitter_buffer) = self.jitter_buffer.as_mut() {
            let dropped = jitter_buffer.clear();
            if dropped > 0 {
                metrics::record_jitter_drops(dropped);
            }
            for handle in [
                jitter_buffer.nominal_timer.take(),
                jitter_buffer.talkspurt_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                self.timers.cancel(handle);
            }
        }
        if let Some(handle) = self.rtcp_timer.take() {
            self.timers.cancel(handle);
        }

        if self.counters.packets_sent == 0 && !self.sent_report {
            debug!("Session {}: leaving silently", self.key);
        } else {
            self.scheduler.sending_bye = true;
            self.send_report(now, true);
        }

        self.active = false;
        info!("Session {} terminated", self.key);
        if self.statistics {
            match self.stats().to_json() {
                Ok(json) => debug!("Session {} statistics: {}", self.key, json),
                Err(e) => warn!("Failed to render statistics: {}", e),
            }
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SessionStats {
        let membership = self.membership();
        let average_e2e_delay_ms = if self.counters.packets_delivered > 0 {
            self.counters.total_e2e_delay_ms as f64 / self.counters.packets_delivered as f64
        } else {
            0.0
        };
        let average_jitter_ms = self
            .remote_ssrc
            .and_then(|ssrc| self.sources.get(ssrc))
            .map_or(0.0, |entry| entry.average_jitter_ms());

        SessionStats {
            own_ssrc: self.own_ssrc,
            remote_ssrc: self.remote_ssrc,
            active: self.active,
            members: membership.members,
            senders: membership.senders,
            rtp: self.counters.clone(),
            rtcp: self.rtcp_counters.clone(),
            average_e2e_delay_ms,
            average_jitter_ms,
            rtt: self.rtt.clone(),
            average_rtt_ms: self.rtt.average().map(|d| d.as_secs_f64() * 1000.0),
            avg_rtcp_size: self.scheduler.avg_rtcp_size(),
            rtcp_interval_secs: self.scheduler.current_interval().as_secs_f64(),
            jitter_buffer: self.jitter_buffer.as_ref().map(JitterBuffer::stats),
        }
    }
}

fn fill_own_sdes(
    sdes: &mut std::collections::HashMap<SdesItemType, String>,
    config: &SdesConfig,
    params: &SessionParams,
) {
    let cname = config
        .cname
        .clone()
        .unwrap_or_else(|| format!("{}@{}", uuid::Uuid::new_v4().simple(), params.local.ip()));
    sdes.insert(SdesItemType::Cname, cname);

    let optional = [
        (SdesItemType::Name, &config.name),
        (SdesItemType::Email, &config.email),
        (SdesItemType::Phone, &config.phone),
        (SdesItemType::Loc, &config.location),
        (SdesItemType::Tool, &config.tool),
        (SdesItemType::Note, &config.note),
    ];
    for (kind, value) in optional {
        if let Some(value) = value {
            sdes.insert(kind, value.clone());
        }
    }
    sdes.entry(SdesItemType::Tool)
        .or_insert_with(|| concat!("rtp-engine/", env!("CARGO_PKG_VERSION")).to_string());
}
