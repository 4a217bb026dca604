//! Reliable-datagram transport over UDP.
//!
//! Implements the `"VS01"` protocol: a connection handshake
//! (`ChallengeReq` → `Challenge` → `Connect` → `Accept`), sequenced and
//! acknowledged data packets with retransmission, a fixed send window,
//! and fragmentation of messages into 1244-byte packets with in-order
//! reassembly on receive. Missing packets block everything behind them;
//! delivery upward is strictly ordered.
//!
//! One spawned task owns the socket and every piece of connection state,
//! so no locks are involved. Timers (deferred ack, periodic flush,
//! resend, ack timeout, disconnect grace, inactivity) are folded into a
//! single wake-up deadline per loop iteration.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use vapor_core::packet::{Packet, PacketType, CHALLENGE_MASK, MAX_PAYLOAD};
use vapor_crypto::SessionCipher;

use crate::event::{Command, Event};
use crate::options::ConnectOptions;
use crate::{Error, Result};


/// Un-acked packets allowed in flight before first-time sends pause.
const AHEAD_COUNT: u32 = 5;

/// How long an ack may wait for traffic to piggy-back on.
const ACK_DELAY: Duration = Duration::from_millis(10);

/// Re-send an unacknowledged packet after this long.
const RESEND_DELAY: Duration = Duration::from_secs(3);

/// A packet unacknowledged for this long kills the connection.
const ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Outgoing-queue sweep interval.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Give up waiting for the peer to ack a graceful disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(15);

/// Messages spanning more than this many packets get an interim ack on
/// every second fragment, keeping the sender's window moving.
const EAGER_ACK_THRESHOLD: u32 = 3;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    ChallengeReqSent,
    ConnectSent,
    Connected,
    Disconnecting,
}

/// An outbound packet awaiting acknowledgment.
struct OutPacket {
    packet_type: PacketType,
    packets_in_msg: u32,
    msg_start_seq: u32,
    msg_size: u32,
    payload: Vec<u8>,
    created: Instant,
    first_sent: Option<Instant>,
    last_sent: Option<Instant>,
}

/// An inbound packet awaiting reassembly of its message.
struct InPacket {
    packet_type: PacketType,
    packets_in_msg: u32,
    msg_start_seq: u32,
    msg_size: u32,
    payload: Vec<u8>,
}

/// Bind the socket, kick off the handshake, and spawn the driver task.
pub(crate) async fn spawn(
    opts: &ConnectOptions,
    events: mpsc::UnboundedSender<Event>,
) -> Result<mpsc::UnboundedSender<Command>> {
    let remote = crate::tcp::resolve(opts).await?;

    let local_ip = opts.local_address.unwrap_or(match remote {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, opts.local_port.unwrap_or(0))).await?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let driver = Driver::new(Arc::new(socket), remote, events);
    tokio::spawn(driver.run(cmd_rx));
    Ok(cmd_tx)
}

struct Driver {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    state: ConnState,

    local_conn_id: u32,
    /// Learned from the first peer packet carrying a nonzero source id.
    remote_conn_id: u32,

    /// Next sequence to assign to an outbound packet.
    out_seq: u32,
    /// Highest sequence actually put on the wire.
    out_seq_sent: u32,
    /// Highest sequence the peer has acknowledged.
    out_seq_acked: u32,
    /// Highest sequence received consecutively from 1.
    in_seq: u32,
    /// Highest sequence we have announced to the peer.
    in_seq_acked: u32,
    /// Highest sequence whose message has been dispatched upward.
    in_seq_handled: u32,

    out_packets: BTreeMap<u32, OutPacket>,
    in_packets: BTreeMap<u32, InPacket>,

    cipher: Option<SessionCipher>,
    server_load: Option<u32>,

    ack_due: Option<Instant>,
    flush_at: Instant,
    disconnect_deadline: Option<Instant>,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,

    stopped: bool,
}

impl Driver {
    fn new(socket: Arc<UdpSocket>, remote: SocketAddr, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            socket,
            remote,
            events,
            state: ConnState::Disconnected,
            local_conn_id: vapor_core::packet::next_conn_id(),
            remote_conn_id: 0,
            out_seq: 1,
            out_seq_sent: 0,
            out_seq_acked: 0,
            in_seq: 0,
            in_seq_acked: 0,
            in_seq_handled: 0,
            out_packets: BTreeMap::new(),
            in_packets: BTreeMap::new(),
            cipher: None,
            server_load: None,
            ack_due: None,
            flush_at: Instant::now() + FLUSH_INTERVAL,
            disconnect_deadline: None,
            idle_timeout: None,
            idle_deadline: None,
            stopped: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0u8; 2048];

        self.state = ConnState::ChallengeReqSent;
        self.send_message(PacketType::ChallengeReq, Vec::new()).await;

        while !self.stopped {
            let wake = self.next_wake();
            let socket = Arc::clone(&self.socket);
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                    Err(e) => self.fatal(e.into()),
                },
                cmd = cmd_rx.recv() => self.handle_command(cmd).await,
                _ = tokio::time::sleep_until(wake) => self.handle_timers().await,
            }
        }
    }

    /// Earliest armed deadline; the flush tick is always armed.
    fn next_wake(&self) -> Instant {
        let mut wake = self.flush_at;
        for deadline in [self.ack_due, self.disconnect_deadline, self.idle_deadline]
            .into_iter()
            .flatten()
        {
            wake = wake.min(deadline);
        }
        wake
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.ack_due.is_some_and(|at| now >= at) {
            self.ack_due = None;
            if self.in_seq_acked < self.in_seq {
                self.send_ack().await;
            }
        }
        if self.stopped {
            return;
        }

        if self.disconnect_deadline.is_some_and(|at| now >= at) {
            tracing::debug!("disconnect grace period elapsed");
            self.destroy();
            return;
        }

        if now >= self.flush_at {
            self.flush_at = now + FLUSH_INTERVAL;
            self.flush_outgoing().await;
        }
        if self.stopped {
            return;
        }

        if self.idle_deadline.is_some_and(|at| now >= at) {
            let _ = self.events.send(Event::Timeout);
            // Rearms on the next inbound datagram.
            self.idle_deadline = None;
        }
    }

    async fn handle_command(&mut self, cmd: Option<Command>) {
        match cmd {
            Some(Command::Send(payload)) => {
                if self.state != ConnState::Connected {
                    tracing::debug!(state = ?self.state, "dropping send while not connected");
                    return;
                }
                let wire_payload = match &self.cipher {
                    Some(cipher) => match cipher.encrypt(&payload) {
                        Ok(ciphertext) => ciphertext,
                        Err(e) => {
                            let _ = self.events.send(Event::EncryptionError(e));
                            return;
                        }
                    },
                    None => payload,
                };
                self.send_message(PacketType::Data, wire_payload).await;
            }
            Some(Command::SetSessionKey(cipher)) => {
                self.cipher = cipher;
            }
            Some(Command::SetTimeout(timeout)) => {
                self.idle_timeout = timeout;
                self.idle_deadline = timeout.map(|t| Instant::now() + t);
            }
            Some(Command::End) => {
                if self.state == ConnState::Connected {
                    tracing::debug!("disconnecting");
                    self.state = ConnState::Disconnecting;
                    self.disconnect_deadline = Some(Instant::now() + DISCONNECT_GRACE);
                    self.send_message(PacketType::Disconnect, Vec::new()).await;
                } else {
                    tracing::debug!(state = ?self.state, "end ignored");
                }
            }
            Some(Command::Destroy) | None => self.destroy(),
        }
    }

    /// Fragment a message into sequenced packets and queue them for
    /// transmission. `Data` payloads arrive here already encrypted.
    async fn send_message(&mut self, packet_type: PacketType, payload: Vec<u8>) {
        let packets_in_msg = payload.len().div_ceil(MAX_PAYLOAD).max(1) as u32;
        let msg_start_seq = self.out_seq;
        let msg_size = payload.len() as u32;
        let now = Instant::now();

        for index in 0..packets_in_msg as usize {
            let lo = index * MAX_PAYLOAD;
            let hi = ((index + 1) * MAX_PAYLOAD).min(payload.len());
            let seq = self.out_seq;
            self.out_seq += 1;
            self.out_packets.insert(
                seq,
                OutPacket {
                    packet_type,
                    packets_in_msg,
                    msg_start_seq,
                    msg_size,
                    payload: payload[lo..hi].to_vec(),
                    created: now,
                    first_sent: None,
                    last_sent: None,
                },
            );
        }

        self.flush_outgoing().await;
    }

    /// Walk the outbound queue in sequence order: drop acked entries, send
    /// fresh ones while the window allows, re-send stale ones, and kill
    /// the connection when a packet outlives the ack timeout.
    async fn flush_outgoing(&mut self) {
        while let Some((&seq, _)) = self.out_packets.first_key_value() {
            if seq <= self.out_seq_acked {
                self.out_packets.remove(&seq);
            } else {
                break;
            }
        }

        let now = Instant::now();
        let seqs: Vec<u32> = self.out_packets.keys().copied().collect();
        for seq in seqs {
            if self.stopped {
                return;
            }
            let Some(record) = self.out_packets.get(&seq) else {
                continue;
            };
            match record.first_sent {
                None => {
                    if self.out_seq_sent >= self.out_seq_acked + AHEAD_COUNT {
                        // Window full; everything later is blocked too.
                        break;
                    }
                    self.transmit(seq).await;
                }
                Some(first_sent) => {
                    if now.duration_since(first_sent) >= ACK_TIMEOUT {
                        self.fatal(Error::ConnectionTimedOut);
                        return;
                    }
                    let last_sent = record.last_sent.unwrap_or(first_sent);
                    if now.duration_since(last_sent) >= RESEND_DELAY {
                        tracing::debug!(
                            seq,
                            age = ?now.duration_since(record.created),
                            "resending unacked packet"
                        );
                        self.transmit(seq).await;
                    }
                }
            }
        }
    }

    async fn transmit(&mut self, seq: u32) {
        let Some(record) = self.out_packets.get(&seq) else {
            return;
        };
        let wire = Packet {
            packet_type: record.packet_type,
            source_conn_id: self.local_conn_id,
            dest_conn_id: self.remote_conn_id,
            seq,
            ack: 0, // filled by wire_send
            packets_in_msg: record.packets_in_msg,
            msg_start_seq: record.msg_start_seq,
            msg_size: record.msg_size,
            payload: record.payload.clone(),
        };

        if self.wire_send(wire).await {
            self.out_seq_sent = self.out_seq_sent.max(seq);
            let now = Instant::now();
            if let Some(record) = self.out_packets.get_mut(&seq) {
                if record.first_sent.is_none() {
                    record.first_sent = Some(now);
                }
                record.last_sent = Some(now);
            }
        }
    }

    /// Put one packet on the wire. Every transmission carries the latest
    /// ack and cancels any pending deferred ack (the packet piggy-backs
    /// it). Returns false if the socket failed and teardown started.
    async fn wire_send(&mut self, mut packet: Packet) -> bool {
        packet.ack = self.in_seq;
        self.in_seq_acked = self.in_seq;
        self.ack_due = None;

        match self.socket.send_to(&packet.serialize(), self.remote).await {
            Ok(_) => true,
            Err(e) => {
                self.fatal(e.into());
                false
            }
        }
    }

    /// Send a pure ack: unsequenced, no payload.
    async fn send_ack(&mut self) {
        let packet = Packet {
            packet_type: PacketType::Datagram,
            source_conn_id: self.local_conn_id,
            dest_conn_id: self.remote_conn_id,
            seq: 0,
            ack: 0, // filled by wire_send
            packets_in_msg: 0,
            msg_start_seq: 0,
            msg_size: 0,
            payload: Vec::new(),
        };
        self.wire_send(packet).await;
    }

    /// Schedule a deferred ack unless one is already pending.
    fn queue_ack(&mut self) {
        if self.ack_due.is_none() {
            self.ack_due = Some(Instant::now() + ACK_DELAY);
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if from != self.remote {
            tracing::debug!(%from, "dropping datagram from unknown peer");
            return;
        }

        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(Instant::now() + timeout);
        }

        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed datagram");
                return;
            }
        };

        // Latch the peer's connection id on first contact, then hold it.
        if self.remote_conn_id == 0 {
            if packet.source_conn_id != 0 {
                self.remote_conn_id = packet.source_conn_id;
            }
        } else if packet.source_conn_id != self.remote_conn_id {
            tracing::debug!(
                got = packet.source_conn_id,
                want = self.remote_conn_id,
                "dropping datagram with wrong source id"
            );
            return;
        }

        if packet.dest_conn_id != self.local_conn_id {
            tracing::debug!(
                got = packet.dest_conn_id,
                want = self.local_conn_id,
                "dropping datagram with wrong destination id"
            );
            return;
        }

        if packet.ack > self.out_seq_acked {
            self.out_seq_acked = packet.ack;
            // An ack can unblock both directions: the send window and, on
            // a graceful disconnect, the teardown in flush_incoming.
            self.flush_outgoing().await;
            if self.stopped {
                return;
            }
            self.flush_incoming().await;
            if self.stopped {
                return;
            }
        }

        if packet.seq > 0 && packet.seq <= self.in_seq {
            // Already received; our ack may have been lost.
            self.queue_ack();
            return;
        }

        if packet.packet_type == PacketType::Datagram {
            return;
        }

        let eager_ack = packet.packets_in_msg > EAGER_ACK_THRESHOLD
            && packet.seq.wrapping_sub(packet.msg_start_seq).wrapping_add(1) % 2 == 0;

        self.in_packets.insert(
            packet.seq,
            InPacket {
                packet_type: packet.packet_type,
                packets_in_msg: packet.packets_in_msg,
                msg_start_seq: packet.msg_start_seq,
                msg_size: packet.msg_size,
                payload: packet.payload,
            },
        );
        self.flush_incoming().await;
        if self.stopped {
            return;
        }

        if eager_ack {
            self.send_ack().await;
        }
    }

    /// Advance the contiguous receive prefix, then dispatch every fully
    /// present message in sequence order. A missing packet blocks all
    /// later messages.
    async fn flush_incoming(&mut self) {
        let mut advanced = false;
        while self.in_packets.contains_key(&(self.in_seq + 1)) {
            self.in_seq += 1;
            advanced = true;
        }
        if advanced {
            self.queue_ack();
        }

        loop {
            // Entries at or below the handled mark are spent.
            while let Some((&seq, _)) = self.in_packets.first_key_value() {
                if seq <= self.in_seq_handled {
                    self.in_packets.remove(&seq);
                } else {
                    break;
                }
            }

            let (head_seq, start_seq, count) = match self.in_packets.first_key_value() {
                Some((&seq, head)) => (seq, head.msg_start_seq, head.packets_in_msg),
                None => break,
            };
            if head_seq != self.in_seq_handled + 1 {
                // Missing piece below the head; cannot dispatch past it.
                break;
            }
            if start_seq != head_seq {
                tracing::debug!(head_seq, start_seq, "head of queue is not a message start");
                break;
            }
            if count == 0 {
                // A sequenced packet never spans zero fragments; drop it
                // or the queue wedges here.
                self.in_packets.remove(&head_seq);
                self.in_seq_handled = head_seq;
                continue;
            }
            if !(head_seq..head_seq + count).all(|seq| self.in_packets.contains_key(&seq)) {
                break;
            }

            let mut parts = Vec::with_capacity(count as usize);
            for seq in head_seq..head_seq + count {
                if let Some(part) = self.in_packets.remove(&seq) {
                    parts.push(part);
                }
            }
            self.in_seq_handled = head_seq + count - 1;

            let consistent = parts.windows(2).all(|pair| {
                pair[0].packet_type == pair[1].packet_type
                    && pair[0].packets_in_msg == pair[1].packets_in_msg
                    && pair[0].msg_start_seq == pair[1].msg_start_seq
                    && pair[0].msg_size == pair[1].msg_size
            });
            if !consistent {
                tracing::debug!(head_seq, "discarding message with inconsistent fragments");
                continue;
            }

            let packet_type = parts[0].packet_type;
            let msg_size = parts[0].msg_size as usize;
            let payload: Vec<u8> = parts.into_iter().flat_map(|part| part.payload).collect();
            if payload.len() != msg_size {
                tracing::debug!(
                    head_seq,
                    expected = msg_size,
                    actual = payload.len(),
                    "discarding message with wrong reassembled size"
                );
                continue;
            }

            self.handle_message(packet_type, payload).await;
            if self.stopped {
                return;
            }
        }

        if self.state == ConnState::Disconnecting && self.out_seq_acked >= self.out_seq_sent {
            tracing::debug!("all outbound packets acked; completing disconnect");
            self.destroy();
        }
    }

    /// Dispatch one reassembled message against the current state.
    async fn handle_message(&mut self, packet_type: PacketType, payload: Vec<u8>) {
        match (self.state, packet_type) {
            (ConnState::ChallengeReqSent, PacketType::Challenge) => {
                if payload.len() < 8 {
                    tracing::debug!(len = payload.len(), "challenge payload too short");
                    return;
                }
                let challenge =
                    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let server_load =
                    u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                self.server_load = Some(server_load);
                tracing::debug!(server_load, "challenge received");

                self.state = ConnState::ConnectSent;
                let reply = (challenge ^ CHALLENGE_MASK).to_le_bytes().to_vec();
                self.send_message(PacketType::Connect, reply).await;
            }
            (ConnState::ConnectSent, PacketType::Accept) => {
                tracing::debug!("connection accepted");
                self.state = ConnState::Connected;
                let _ = self.events.send(Event::Connected {
                    server_load: self.server_load,
                });
            }
            (ConnState::Connected, PacketType::Data) => {
                let plain = match &self.cipher {
                    Some(cipher) => match cipher.decrypt(&payload) {
                        Ok(plain) => plain,
                        Err(e) => {
                            // The peer may recover; drop the payload only.
                            let _ = self.events.send(Event::EncryptionError(e));
                            return;
                        }
                    },
                    None => payload,
                };
                let _ = self.events.send(Event::Packet(plain));
            }
            (ConnState::Connected, PacketType::Datagram) => {}
            (ConnState::Connected | ConnState::Disconnecting, PacketType::Disconnect) => {
                tracing::debug!("peer disconnected");
                self.send_ack().await;
                self.destroy();
            }
            (state, packet_type) => {
                tracing::debug!(?state, ?packet_type, "dropping unexpected message");
            }
        }
    }

    /// Unconditional teardown: cancel every timer, drop all queues, and
    /// emit `Closed`. Safe to call repeatedly.
    fn destroy(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.state = ConnState::Disconnected;
        self.ack_due = None;
        self.disconnect_deadline = None;
        self.idle_deadline = None;
        self.out_packets.clear();
        self.in_packets.clear();
        self.cipher = None;
        let _ = self.events.send(Event::Closed);
    }

    fn fatal(&mut self, error: Error) {
        if self.stopped {
            return;
        }
        let _ = self.events.send(Event::Fatal(error));
        self.destroy();
    }
}
