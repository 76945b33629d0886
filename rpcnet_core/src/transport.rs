//! Transport adapter (C3): delivery-mode semantics (unreliable, sequenced,
//! reliable unordered/ordered) live here, not in the RPC endpoint. The
//! endpoint only ever calls [`Transport::send`]/[`Transport::recv`] with
//! encrypted session records and a [`DeliveryMode`]; MTU fragmentation,
//! acknowledgement, and retransmission are this module's problem.
//!
//! Grounded in the teacher's `UnreliableConn`/`ReliableListener` UDP
//! wrappers (`net.rs`), generalized from a single JSON-framed datagram
//! channel into a multiplexed one with per-channel ordering guarantees.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::error::RpcError;

/// How a single outgoing payload should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Fire and forget; may be lost, duplicated, or reordered.
    Unreliable,
    /// Lost packets are tolerated but stale-arriving ones are dropped in
    /// favor of the newest seen for the implicit sequenced channel.
    UnreliableSequenced,
    /// Guaranteed delivery, no ordering guarantee across packets.
    ReliableUnordered,
    /// Guaranteed delivery and in-order per named channel.
    ReliableOrdered(u8),
}

impl DeliveryMode {
    fn wire_kind(&self) -> u8 {
        match self {
            DeliveryMode::Unreliable => 0,
            DeliveryMode::UnreliableSequenced => 1,
            DeliveryMode::ReliableUnordered => 2,
            DeliveryMode::ReliableOrdered(_) => 3,
        }
    }

    fn channel(&self) -> u8 {
        match self {
            DeliveryMode::ReliableOrdered(c) => *c,
            _ => 0,
        }
    }

    fn is_reliable(&self) -> bool {
        matches!(
            self,
            DeliveryMode::ReliableUnordered | DeliveryMode::ReliableOrdered(_)
        )
    }
}

/// Abstraction the RPC endpoint sends/receives through. A UDP
/// implementation is provided; tests may swap in an in-memory pair.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &[u8], mode: DeliveryMode) -> Result<(), RpcError>;
    /// Returns the next fully reassembled, in-order (per its mode) payload.
    async fn recv(&self) -> Result<Vec<u8>, RpcError>;
    fn peer_addr(&self) -> SocketAddr;
    async fn close(&self);
}

const DATA: u8 = 0;
const ACK: u8 = 1;
const FRAGMENT: u8 = 2;
const HEADER_LEN: usize = 1 + 1 + 1 + 4; // kind, mode, channel, seq
const DEFAULT_MTU: usize = 1200;
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(200);
const MAX_RETRANSMITS: u32 = 20;

struct PendingAck {
    payload: Vec<u8>,
    attempts: u32,
    last_sent: tokio::time::Instant,
}

struct FragmentAssembly {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

struct OrderedChannel {
    next_expected: u32,
    pending: BTreeMap<u32, Vec<u8>>,
}

/// UDP-backed [`Transport`]. One instance per peer connection (the socket
/// is `connect`ed, matching the teacher's `UnreliableConn`).
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mtu: usize,
    next_seq: AtomicU32,
    pending_acks: Mutex<HashMap<(u8, u32), PendingAck>>,
    seen_unordered: Mutex<HashMap<u8, HashSet<u32>>>,
    highest_sequenced: Mutex<HashMap<u8, u32>>,
    ordered: Mutex<HashMap<u8, OrderedChannel>>,
    fragments: Mutex<HashMap<u32, FragmentAssembly>>,
    next_fragment_id: AtomicU32,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Mutex<bool>,
}

impl UdpTransport {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> Result<Arc<Self>, RpcError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|_| RpcError::TransportDisconnected)?;
        socket
            .connect(peer)
            .await
            .map_err(|_| RpcError::TransportDisconnected)?;
        Ok(Self::from_connected_socket(socket, peer))
    }

    /// The local address this connection's socket is bound to, so a
    /// listener demultiplexing many peers off a rendezvous socket can tell
    /// a client where its dedicated connection lives.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn from_connected_socket(socket: UdpSocket, peer: SocketAddr) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            peer,
            mtu: DEFAULT_MTU,
            next_seq: AtomicU32::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            seen_unordered: Mutex::new(HashMap::new()),
            highest_sequenced: Mutex::new(HashMap::new()),
            ordered: Mutex::new(HashMap::new()),
            fragments: Mutex::new(HashMap::new()),
            next_fragment_id: AtomicU32::new(0),
            inbound: tx,
            inbound_rx: Mutex::new(rx),
            closed: Mutex::new(false),
        });
        transport.clone().spawn_reader();
        transport.clone().spawn_retransmitter();
        transport
    }

    fn spawn_reader(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                if *self.closed.lock().await {
                    return;
                }
                match self.socket.recv(&mut buf).await {
                    Ok(n) => {
                        if let Err(e) = self.handle_inbound(&buf[..n]).await {
                            warn!(error = %e, "dropping malformed transport frame");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "udp recv error, transport reader exiting");
                        return;
                    }
                }
            }
        });
    }

    fn spawn_retransmitter(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETRANSMIT_INTERVAL);
            loop {
                interval.tick().await;
                if *self.closed.lock().await {
                    return;
                }
                let mut pending = self.pending_acks.lock().await;
                let now = tokio::time::Instant::now();
                let mut to_drop = Vec::new();
                for (key, entry) in pending.iter_mut() {
                    if now.duration_since(entry.last_sent) >= RETRANSMIT_INTERVAL {
                        if entry.attempts >= MAX_RETRANSMITS {
                            to_drop.push(*key);
                            continue;
                        }
                        entry.attempts += 1;
                        entry.last_sent = now;
                        let _ = self.socket.send(&entry.payload).await;
                        trace!(channel = key.0, seq = key.1, attempts = entry.attempts, "retransmitted");
                    }
                }
                for key in to_drop {
                    pending.remove(&key);
                }
            }
        });
    }

    async fn handle_inbound(&self, frame: &[u8]) -> Result<(), RpcError> {
        let kind = *frame.first().ok_or(RpcError::MalformedMessage(
            crate::error::CodecError::Truncated {
                needed: 1,
                available: 0,
            },
        ))?;
        match kind {
            ACK => {
                if frame.len() < 6 {
                    return Ok(());
                }
                let channel = frame[1];
                let seq = u32::from_le_bytes(frame[2..6].try_into().unwrap());
                self.pending_acks.lock().await.remove(&(channel, seq));
                Ok(())
            }
            FRAGMENT => self.handle_fragment(frame).await,
            DATA => self.handle_data(frame).await,
            _ => Ok(()),
        }
    }

    async fn handle_data(&self, frame: &[u8]) -> Result<(), RpcError> {
        if frame.len() < HEADER_LEN {
            return Ok(());
        }
        let mode_byte = frame[1];
        let channel = frame[2];
        let seq = u32::from_le_bytes(frame[3..7].try_into().unwrap());
        let payload = frame[HEADER_LEN..].to_vec();

        if mode_byte == DeliveryMode::ReliableUnordered.wire_kind()
            || mode_byte == DeliveryMode::ReliableOrdered(0).wire_kind()
        {
            self.send_ack(channel, seq).await;
        }

        match mode_byte {
            k if k == DeliveryMode::Unreliable.wire_kind() => {
                let _ = self.inbound.send(payload);
            }
            k if k == DeliveryMode::UnreliableSequenced.wire_kind() => {
                let mut highest = self.highest_sequenced.lock().await;
                let is_newest = match highest.get(&channel) {
                    Some(&h) => seq > h,
                    None => true,
                };
                if is_newest {
                    highest.insert(channel, seq);
                    let _ = self.inbound.send(payload);
                }
            }
            k if k == DeliveryMode::ReliableUnordered.wire_kind() => {
                let mut seen = self.seen_unordered.lock().await;
                let set = seen.entry(channel).or_default();
                if set.insert(seq) {
                    let _ = self.inbound.send(payload);
                }
            }
            k if k == DeliveryMode::ReliableOrdered(0).wire_kind() => {
                let mut ordered = self.ordered.lock().await;
                let chan = ordered.entry(channel).or_insert_with(|| OrderedChannel {
                    next_expected: 0,
                    pending: BTreeMap::new(),
                });
                chan.pending.insert(seq, payload);
                while let Some(next) = chan.pending.remove(&chan.next_expected) {
                    let _ = self.inbound.send(next);
                    chan.next_expected += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_fragment(&self, frame: &[u8]) -> Result<(), RpcError> {
        // [kind][frag_id:4][index:2][count:2][mode][channel][seq:4][data...]
        if frame.len() < 1 + 4 + 2 + 2 {
            return Ok(());
        }
        let frag_id = u32::from_le_bytes(frame[1..5].try_into().unwrap());
        let index = u16::from_le_bytes(frame[5..7].try_into().unwrap()) as usize;
        let count = u16::from_le_bytes(frame[7..9].try_into().unwrap()) as usize;
        let rest = &frame[9..];

        let mut fragments = self.fragments.lock().await;
        let entry = fragments.entry(frag_id).or_insert_with(|| FragmentAssembly {
            parts: vec![None; count],
            received: 0,
        });
        if entry.parts.get(index).map(|p| p.is_none()).unwrap_or(false) {
            entry.parts[index] = Some(rest.to_vec());
            entry.received += 1;
        }
        if entry.received == count {
            let assembled: Vec<u8> = entry.parts.iter().flatten().flat_map(|p| p.clone()).collect();
            fragments.remove(&frag_id);
            drop(fragments);
            return self.handle_data(&assembled).await;
        }
        Ok(())
    }

    async fn send_ack(&self, channel: u8, seq: u32) {
        let mut frame = Vec::with_capacity(6);
        frame.push(ACK);
        frame.push(channel);
        frame.extend_from_slice(&seq.to_le_bytes());
        let _ = self.socket.send(&frame).await;
    }

    async fn send_framed(&self, payload: &[u8], mode: DeliveryMode) -> Result<(), RpcError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(DATA);
        frame.push(mode.wire_kind());
        frame.push(mode.channel());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(payload);

        if frame.len() > self.mtu {
            return self.send_fragmented(&frame, mode).await;
        }

        if mode.is_reliable() {
            self.pending_acks.lock().await.insert(
                (mode.channel(), seq),
                PendingAck {
                    payload: frame.clone(),
                    attempts: 0,
                    last_sent: tokio::time::Instant::now(),
                },
            );
        }
        self.socket
            .send(&frame)
            .await
            .map_err(|_| RpcError::TransportDisconnected)?;
        Ok(())
    }

    async fn send_fragmented(&self, full_frame: &[u8], mode: DeliveryMode) -> Result<(), RpcError> {
        let chunk_size = self.mtu.saturating_sub(9).max(1);
        let chunks: Vec<&[u8]> = full_frame.chunks(chunk_size).collect();
        if chunks.len() > u16::MAX as usize {
            return Err(RpcError::MtuExceeded);
        }
        let frag_id = self.next_fragment_id.fetch_add(1, Ordering::Relaxed);
        let count = chunks.len() as u16;
        for (index, chunk) in chunks.iter().enumerate() {
            let mut frame = Vec::with_capacity(9 + chunk.len());
            frame.push(FRAGMENT);
            frame.extend_from_slice(&frag_id.to_le_bytes());
            frame.extend_from_slice(&(index as u16).to_le_bytes());
            frame.extend_from_slice(&count.to_le_bytes());
            frame.extend_from_slice(chunk);
            self.socket
                .send(&frame)
                .await
                .map_err(|_| RpcError::TransportDisconnected)?;
        }
        let _ = mode;
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, payload: &[u8], mode: DeliveryMode) -> Result<(), RpcError> {
        if *self.closed.lock().await {
            return Err(RpcError::TransportDisconnected);
        }
        self.send_framed(payload, mode).await
    }

    async fn recv(&self) -> Result<Vec<u8>, RpcError> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(RpcError::TransportDisconnected)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn close(&self) {
        *self.closed.lock().await = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_pair() -> (Arc<UdpTransport>, Arc<UdpTransport>) {
        let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a_sock.local_addr().unwrap();
        let b_addr = b_sock.local_addr().unwrap();
        a_sock.connect(b_addr).await.unwrap();
        b_sock.connect(a_addr).await.unwrap();
        let a = UdpTransport::from_connected_socket(a_sock, b_addr);
        let b = UdpTransport::from_connected_socket(b_sock, a_addr);
        (a, b)
    }

    #[tokio::test]
    async fn unreliable_delivers_payload() {
        let (a, b) = loopback_pair().await;
        a.send(b"hello", DeliveryMode::Unreliable).await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn reliable_ordered_preserves_order_despite_reordered_arrival() {
        let (a, b) = loopback_pair().await;
        for i in 0..5u8 {
            a.send(&[i], DeliveryMode::ReliableOrdered(0)).await.unwrap();
        }
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(b.recv().await.unwrap()[0]);
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn large_payload_is_fragmented_and_reassembled() {
        let (a, b) = loopback_pair().await;
        let payload = vec![42u8; 5000];
        a.send(&payload, DeliveryMode::ReliableUnordered).await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got, payload);
    }
}
