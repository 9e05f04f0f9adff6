//! UDP network edge: decodes client packets, maps socket addresses to
//! connection identities, dispatches into the game service and drains its
//! push channel.
//!
//! The wire uses bincode-encoded [`Packet`] values. Malformed datagrams and
//! packets that fail any admission check simply vanish; to the sender that
//! is indistinguishable from network loss.

use crate::anticheat::KeyBatch;
use crate::service::{GameService, PushEvent, RoundSummary};
use crate::session::ConnId;
use crate::utils::get_timestamp;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::Packet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Connections with no inbound traffic for this long are swept and treated
/// as disconnected. Must exceed the longest legal in-round silence (a full
/// Classic round plus the backstop grace).
const CLIENT_TIMEOUT_MS: u64 = 60_000;
/// How often the idle sweep runs.
const SWEEP_INTERVAL_MS: u64 = 5_000;

/// Messages sent from the receiver task to the main dispatch loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Socket address <-> connection identity bookkeeping, owned by the main
/// dispatch loop.
#[derive(Default)]
struct ConnTable {
    by_addr: HashMap<SocketAddr, ConnId>,
    by_id: HashMap<ConnId, SocketAddr>,
    last_seen: HashMap<ConnId, u64>,
    next_id: ConnId,
}

impl ConnTable {
    /// Returns the existing id for an address or assigns the next one.
    fn id_for(&mut self, addr: SocketAddr, now_ms: u64) -> ConnId {
        if let Some(id) = self.by_addr.get(&addr).copied() {
            self.last_seen.insert(id, now_ms);
            return id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.by_addr.insert(addr, id);
        self.by_id.insert(id, addr);
        self.last_seen.insert(id, now_ms);
        id
    }

    /// Records traffic from a known address.
    fn touch(&mut self, addr: SocketAddr, now_ms: u64) {
        if let Some(id) = self.by_addr.get(&addr) {
            self.last_seen.insert(*id, now_ms);
        }
    }

    fn lookup(&self, addr: SocketAddr) -> Option<ConnId> {
        self.by_addr.get(&addr).copied()
    }

    fn addr_of(&self, conn: ConnId) -> Option<SocketAddr> {
        self.by_id.get(&conn).copied()
    }

    fn remove(&mut self, addr: SocketAddr) -> Option<ConnId> {
        let id = self.by_addr.remove(&addr)?;
        self.by_id.remove(&id);
        self.last_seen.remove(&id);
        Some(id)
    }

    /// Connections whose last packet is at least `timeout_ms` old.
    fn idle(&self, now_ms: u64, timeout_ms: u64) -> Vec<(ConnId, SocketAddr)> {
        self.last_seen
            .iter()
            .filter(|(_, seen)| now_ms.saturating_sub(**seen) >= timeout_ms)
            .filter_map(|(id, _)| self.by_id.get(id).map(|addr| (*id, *addr)))
            .collect()
    }

    fn all_addrs(&self) -> Vec<SocketAddr> {
        self.by_id.values().copied().collect()
    }
}

/// Connection-time origin check against the fixed allow-list.
fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|a| a == origin)
}

/// Main server coordinating the UDP socket and the game service
pub struct Server {
    socket: Arc<UdpSocket>,
    service: Arc<GameService>,
    push_rx: mpsc::UnboundedReceiver<PushEvent>,
    conns: ConnTable,
    allowed_origins: Vec<String>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        service: Arc<GameService>,
        push_rx: mpsc::UnboundedReceiver<PushEvent>,
        allowed_origins: Vec<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Ok(Server {
            socket,
            service,
            push_rx,
            conns: ConnTable::default(),
            allowed_origins,
            server_tx,
            server_rx,
        })
    }

    /// Spawns the task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 4096];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            // Garbage in, silence out.
                            debug!("Undecodable datagram from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        match serialize(packet) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
            Err(e) => error!("Failed to serialize packet: {}", e),
        }
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        self.conns.touch(addr, get_timestamp());
        match packet {
            Packet::Connect { origin, name, mode } => {
                if !origin_allowed(&self.allowed_origins, &origin) {
                    warn!("Connection from {} with origin {:?} refused", addr, origin);
                    return;
                }
                let conn = self.conns.id_for(addr, get_timestamp());
                if let Some(token) = self.service.create_session(conn, &name, mode).await {
                    let response = Packet::RoundStarted {
                        token,
                        duration_ms: mode.round_duration_ms(),
                    };
                    self.send_packet(&response, addr).await;
                }
                // Cooldown refusals stay silent: no token, no error.
            }

            Packet::KeyBatch { keys, token } => {
                if let Some(conn) = self.conns.lookup(addr) {
                    self.service.submit_batch(conn, KeyBatch { keys, token }).await;
                }
            }

            Packet::RoundOver { reported_score } => {
                if let Some(conn) = self.conns.lookup(addr) {
                    self.service.end_session(conn, reported_score).await;
                }
            }

            Packet::Disconnect => {
                if let Some(conn) = self.conns.remove(addr) {
                    self.service.on_disconnect(conn).await;
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Score { conn, score } => {
                if let Some(addr) = self.conns.addr_of(conn) {
                    self.send_packet(&Packet::ScoreUpdate { score }, addr).await;
                }
            }
            PushEvent::RoundResult { conn, result } => {
                if let Some(addr) = self.conns.addr_of(conn) {
                    let packet = round_result_packet(&result);
                    self.send_packet(&packet, addr).await;
                }
            }
            PushEvent::LeaderboardChanged => {
                // Best-effort broadcast; clients can always pull.
                for addr in self.conns.all_addrs() {
                    self.send_packet(&Packet::LeaderboardChanged, addr).await;
                }
            }
        }
    }

    /// Drives disconnect handling for connections that silently vanished;
    /// UDP gives no close signal, so silence is the only one available.
    async fn sweep_idle(&mut self) {
        for (conn, addr) in self.conns.idle(get_timestamp(), CLIENT_TIMEOUT_MS) {
            info!("Conn {} at {} timed out, dropping", conn, addr);
            self.conns.remove(addr);
            self.service.on_disconnect(conn).await;
        }
    }

    /// Main loop: interleaves inbound packets with service pushes and the
    /// periodic idle sweep.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        let mut sweep =
            tokio::time::interval(std::time::Duration::from_millis(SWEEP_INTERVAL_MS));
        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },
                event = self.push_rx.recv() => {
                    match event {
                        Some(event) => self.handle_push(event).await,
                        None => break,
                    }
                },
                _ = sweep.tick() => {
                    self.sweep_idle().await;
                },
            }
        }
        Ok(())
    }
}

fn round_result_packet(result: &RoundSummary) -> Packet {
    Packet::RoundResult {
        score: result.score,
        ranking_score: result.ranking_score,
        is_personal_best: result.is_personal_best,
        all_time_best: result.all_time_best,
        unlocked_profiles: result.unlocked_profiles.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_conn_table_assigns_stable_ids() {
        let mut table = ConnTable::default();
        let a = table.id_for(addr(1000), 0);
        let b = table.id_for(addr(2000), 0);
        assert_ne!(a, b);
        assert_eq!(table.id_for(addr(1000), 0), a);
        assert_eq!(table.lookup(addr(2000)), Some(b));
        assert_eq!(table.addr_of(a), Some(addr(1000)));
    }

    #[test]
    fn test_conn_table_remove() {
        let mut table = ConnTable::default();
        let a = table.id_for(addr(1000), 0);
        assert_eq!(table.remove(addr(1000)), Some(a));
        assert_eq!(table.lookup(addr(1000)), None);
        assert_eq!(table.addr_of(a), None);
        assert_eq!(table.remove(addr(1000)), None);
    }

    #[test]
    fn test_conn_table_never_reuses_ids() {
        let mut table = ConnTable::default();
        let a = table.id_for(addr(1000), 0);
        table.remove(addr(1000));
        let b = table.id_for(addr(1000), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_idle_connections_are_listed_for_sweep() {
        let mut table = ConnTable::default();
        let a = table.id_for(addr(1000), 0);
        let b = table.id_for(addr(2000), 40_000);

        // Nobody is past the timeout yet.
        assert!(table.idle(30_000, CLIENT_TIMEOUT_MS).is_empty());

        // Only the connection that went silent shows up.
        assert_eq!(table.idle(65_000, CLIENT_TIMEOUT_MS), vec![(a, addr(1000))]);

        // Any packet refreshes the clock.
        table.touch(addr(1000), 70_000);
        assert!(table.idle(80_000, CLIENT_TIMEOUT_MS).is_empty());

        // A swept entry stays gone; the other eventually times out too.
        table.remove(addr(1000));
        assert_eq!(
            table.idle(200_000, CLIENT_TIMEOUT_MS),
            vec![(b, addr(2000))]
        );
    }

    #[test]
    fn test_origin_allow_list() {
        let allowed = vec!["https://keyrush.example".to_string()];
        assert!(origin_allowed(&allowed, "https://keyrush.example"));
        assert!(!origin_allowed(&allowed, "https://evil.example"));
        assert!(!origin_allowed(&allowed, ""));
        assert!(!origin_allowed(&[], "https://keyrush.example"));
    }

    #[test]
    fn test_round_result_packet_mapping() {
        let summary = RoundSummary {
            score: 12,
            ranking_score: 340,
            is_personal_best: true,
            all_time_best: 340,
            unlocked_profiles: vec!["STEADY".to_string()],
        };
        match round_result_packet(&summary) {
            Packet::RoundResult {
                score,
                ranking_score,
                is_personal_best,
                all_time_best,
                unlocked_profiles,
            } => {
                assert_eq!(score, 12);
                assert_eq!(ranking_score, 340);
                assert!(is_personal_best);
                assert_eq!(all_time_best, 340);
                assert_eq!(unlocked_profiles, vec!["STEADY"]);
            }
            _ => panic!("Unexpected packet type"),
        }
    }
}
