//! Universe-discovery receiver.
//!
//! Listens on the discovery multicast groups and reassembles each
//! source's paged universe list. A page sequence must arrive in order
//! starting at page 0; joining mid-sequence resets and waits for the
//! next cycle. A completed list is only announced when it changed and
//! is sorted ascending.

use std::collections::HashMap;

use sacn_protocol::packet::{DiscoveryPacket, Packet};
use sacn_protocol::{
    Interface, IpMode, SourceName, DISCOVERY_GROUP_V4, DISCOVERY_GROUP_V6,
    DISCOVERY_SOURCE_TIMEOUT, LOSS_HEARTBEAT_PERIOD,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::ReceiverError;
use crate::events::DiscoveryEvent;
use crate::socket::{ReaderMessage, RxSocket};

#[derive(Debug, Clone)]
pub struct DiscoveryReceiverConfig {
    pub ip_mode: IpMode,
    pub interfaces: Vec<Interface>,
}

impl Default for DiscoveryReceiverConfig {
    fn default() -> Self {
        DiscoveryReceiverConfig {
            ip_mode: IpMode::Ipv4Only,
            interfaces: vec![Interface::any()],
        }
    }
}

struct DiscoverySource {
    name: SourceName,
    universes: Vec<u16>,
    next_page: u8,
    next_universe_index: usize,
    dirty: bool,
    expiry: Instant,
}

/// Page-assembly state for every source heard on the discovery groups.
/// Socket-free for the same reason as the raw receiver's state.
pub(crate) struct DiscoveryState {
    sources: HashMap<Uuid, DiscoverySource>,
}

impl DiscoveryState {
    pub fn new() -> Self {
        DiscoveryState {
            sources: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.sources.clear();
    }

    pub fn handle_packet(&mut self, packet: DiscoveryPacket, out: &mut Vec<DiscoveryEvent>) {
        let now = Instant::now();
        let source = self
            .sources
            .entry(packet.cid)
            .or_insert_with(|| DiscoverySource {
                name: packet.source_name.clone(),
                universes: Vec::new(),
                next_page: 0,
                next_universe_index: 0,
                dirty: false,
                expiry: now + DISCOVERY_SOURCE_TIMEOUT,
            });
        source.expiry = now + DISCOVERY_SOURCE_TIMEOUT;
        source.name = packet.source_name.clone();

        let incoming: Vec<u16> = packet.universes.iter().map(|u| u.get()).collect();
        let page = packet.page;
        let last_page = packet.last_page;

        if page > 0 && page != source.next_page {
            // Joined mid-sequence; wait for the next page-0 cycle.
            trace!(cid = %packet.cid, page, expected = source.next_page, "discovery page out of order");
            source.next_page = 0;
            source.next_universe_index = 0;
            return;
        }
        if page == 0 {
            source.next_page = 0;
            source.next_universe_index = 0;
        }

        let count = incoming.len();
        let remaining = source
            .universes
            .len()
            .saturating_sub(source.next_universe_index);
        let existing_end = (source.next_universe_index + count).min(source.universes.len());
        let existing_block = &source.universes[source.next_universe_index..existing_end];

        let changed = count > remaining
            || (page == last_page && count < remaining)
            || existing_block != incoming.as_slice();
        if changed {
            source.dirty = true;
            source.universes.truncate(source.next_universe_index);
            source.universes.extend_from_slice(&incoming);
        }

        if page < last_page {
            source.next_universe_index += count;
            source.next_page += 1;
        } else {
            if source.dirty {
                let ascending = source.universes.windows(2).all(|pair| pair[0] <= pair[1]);
                if ascending {
                    debug!(
                        cid = %packet.cid,
                        universes = source.universes.len(),
                        "discovery list complete"
                    );
                    out.push(DiscoveryEvent::SourceDiscovered {
                        cid: packet.cid,
                        name: source.name.clone(),
                        universes: source.universes.clone(),
                    });
                    source.dirty = false;
                } else {
                    trace!(cid = %packet.cid, "discovery list not ascending, withheld");
                }
            }
            source.next_page = 0;
            source.next_universe_index = 0;
        }
    }

    /// Evict sources that missed two discovery intervals.
    pub fn heartbeat(&mut self, out: &mut Vec<DiscoveryEvent>) {
        let now = Instant::now();
        let mut lost = Vec::new();
        self.sources.retain(|cid, source| {
            if now < source.expiry {
                true
            } else {
                lost.push(*cid);
                false
            }
        });
        if !lost.is_empty() {
            debug!(count = lost.len(), "discovery sources expired");
            out.push(DiscoveryEvent::SourcesLost(lost));
        }
    }

    #[cfg(test)]
    fn source_count(&self) -> usize {
        self.sources.len()
    }
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<(), ReceiverError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), ReceiverError>>,
    },
    UpdateInterfaces {
        interfaces: Vec<Interface>,
        reply: oneshot::Sender<Result<(), ReceiverError>>,
    },
}

/// Handle to the discovery-listening worker.
#[derive(Clone)]
pub struct DiscoveryReceiver {
    commands: mpsc::UnboundedSender<Command>,
}

impl DiscoveryReceiver {
    /// Validate the configuration and spawn the worker. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        config: DiscoveryReceiverConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>), ReceiverError> {
        if config.ip_mode.includes_v6() && config.interfaces.is_empty() {
            return Err(ReceiverError::Ipv6RequiresInterfaces);
        }
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            ip_mode: config.ip_mode,
            interfaces: config.interfaces,
            state: DiscoveryState::new(),
            sockets: Vec::new(),
            datagram_tx,
            events,
            running: false,
            cancel: CancellationToken::new(),
        };
        tokio::spawn(worker.run(command_rx, datagram_rx));
        Ok((DiscoveryReceiver { commands }, event_rx))
    }

    pub async fn start(&self) -> Result<(), ReceiverError> {
        self.request(|reply| Command::Start { reply }).await
    }

    pub async fn stop(&self) -> Result<(), ReceiverError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn update_interfaces(&self, interfaces: Vec<Interface>) -> Result<(), ReceiverError> {
        self.request(|reply| Command::UpdateInterfaces { interfaces, reply })
            .await
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), ReceiverError>>) -> Command,
    ) -> Result<(), ReceiverError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ReceiverError::Closed)?;
        rx.await.map_err(|_| ReceiverError::Closed)?
    }
}

struct Worker {
    ip_mode: IpMode,
    interfaces: Vec<Interface>,
    state: DiscoveryState,
    sockets: Vec<RxSocket>,
    datagram_tx: mpsc::UnboundedSender<ReaderMessage>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    running: bool,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut datagrams: mpsc::UnboundedReceiver<ReaderMessage>,
    ) {
        let mut heartbeat = tokio::time::interval(LOSS_HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { reply }) => {
                        let _ = reply.send(self.start());
                    }
                    Some(Command::Stop { reply }) => {
                        let _ = reply.send(self.stop());
                    }
                    Some(Command::UpdateInterfaces { interfaces, reply }) => {
                        let _ = reply.send(self.update_interfaces(interfaces));
                    }
                    None => {
                        self.cancel.cancel();
                        return;
                    }
                },
                Some(message) = datagrams.recv(), if self.running => match message {
                    ReaderMessage::Datagram(datagram) => match Packet::parse(&datagram.bytes) {
                        Ok(Packet::Discovery(packet)) => {
                            let mut out = Vec::new();
                            self.state.handle_packet(packet, &mut out);
                            for event in out {
                                let _ = self.events.send(event);
                            }
                        }
                        // Data universes share the port; their traffic
                        // lands here when a data group is also joined on
                        // this host. Not ours to judge.
                        Ok(Packet::Data(_)) => {}
                        Err(error) => {
                            debug!(%error, from = %datagram.source, "dropping unparseable datagram");
                        }
                    },
                    ReaderMessage::Closed { interface, error } => {
                        let _ = self.events.send(DiscoveryEvent::SocketClosed {
                            interface: interface.clone(),
                            error: sacn_protocol::SocketError::Receive {
                                ctx: interface,
                                source: error,
                            },
                        });
                    }
                },
                _ = heartbeat.tick(), if self.running => {
                    let mut out = Vec::new();
                    self.state.heartbeat(&mut out);
                    for event in out {
                        let _ = self.events.send(event);
                    }
                }
            }
        }
    }

    fn start(&mut self) -> Result<(), ReceiverError> {
        if self.running {
            return Err(ReceiverError::AlreadyStarted);
        }
        self.cancel = CancellationToken::new();
        let mut sockets = Vec::with_capacity(self.interfaces.len());
        for interface in &self.interfaces {
            sockets.push(RxSocket::open(
                self.ip_mode,
                interface,
                &[DISCOVERY_GROUP_V4],
                &[DISCOVERY_GROUP_V6],
                self.datagram_tx.clone(),
                &self.cancel,
            )?);
        }
        self.sockets = sockets;
        self.running = true;
        debug!(interfaces = self.sockets.len(), "discovery receiver started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ReceiverError> {
        if !self.running {
            return Err(ReceiverError::NotStarted);
        }
        self.cancel.cancel();
        self.sockets.clear();
        self.running = false;
        self.state.reset();
        debug!("discovery receiver stopped");
        Ok(())
    }

    fn update_interfaces(&mut self, interfaces: Vec<Interface>) -> Result<(), ReceiverError> {
        if self.ip_mode.includes_v6() && interfaces.is_empty() {
            return Err(ReceiverError::Ipv6RequiresInterfaces);
        }
        if !self.running {
            self.interfaces = interfaces;
            return Ok(());
        }
        let mut added = Vec::new();
        for interface in &interfaces {
            if !self.sockets.iter().any(|s| s.interface == *interface) {
                added.push(RxSocket::open(
                    self.ip_mode,
                    interface,
                    &[DISCOVERY_GROUP_V4],
                    &[DISCOVERY_GROUP_V6],
                    self.datagram_tx.clone(),
                    &self.cancel,
                )?);
            }
        }
        self.sockets.retain(|socket| {
            if interfaces.contains(&socket.interface) {
                true
            } else {
                socket.close();
                false
            }
        });
        self.sockets.extend(added);
        self.interfaces = interfaces;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sacn_protocol::Universe;
    use std::time::Duration;

    fn cid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn page(cid_n: u8, page: u8, last_page: u8, universes: &[u16]) -> DiscoveryPacket {
        DiscoveryPacket {
            cid: cid(cid_n),
            source_name: SourceName::new("rack"),
            page,
            last_page,
            universes: universes
                .iter()
                .map(|u| Universe::new(*u).unwrap())
                .collect(),
        }
    }

    fn discovered(events: &[DiscoveryEvent]) -> Option<&Vec<u16>> {
        events.iter().find_map(|event| match event {
            DiscoveryEvent::SourceDiscovered { universes, .. } => Some(universes),
            _ => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn single_page_list_announced() {
        let mut state = DiscoveryState::new();
        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 0, &[1, 2, 7]), &mut out);
        assert_eq!(discovered(&out), Some(&vec![1, 2, 7]));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_list_not_reannounced() {
        let mut state = DiscoveryState::new();
        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 0, &[1, 2]), &mut out);
        assert_eq!(out.len(), 1);

        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 0, &[1, 2]), &mut out);
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn paged_list_announced_after_final_page() {
        let first: Vec<u16> = (1..=512).collect();
        let second: Vec<u16> = (513..=700).collect();

        let mut state = DiscoveryState::new();
        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 1, &first), &mut out);
        assert!(out.is_empty(), "no event until the final page");

        state.handle_packet(page(1, 1, 1, &second), &mut out);
        let universes = discovered(&out).expect("completed list announced");
        assert_eq!(universes.len(), 700);
        assert_eq!(universes[0], 1);
        assert_eq!(universes[699], 700);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_sequence_join_waits_for_next_cycle() {
        let first: Vec<u16> = (1..=512).collect();
        let second: Vec<u16> = (513..=700).collect();

        let mut state = DiscoveryState::new();
        let mut out = Vec::new();
        // Page 1 arrives first (we joined mid-cycle): dropped.
        state.handle_packet(page(1, 1, 1, &second), &mut out);
        assert!(out.is_empty());

        // Next full cycle lands normally.
        state.handle_packet(page(1, 0, 1, &first), &mut out);
        state.handle_packet(page(1, 1, 1, &second), &mut out);
        assert_eq!(discovered(&out).map(Vec::len), Some(700));
    }

    #[tokio::test(start_paused = true)]
    async fn unsorted_list_withheld() {
        let mut state = DiscoveryState::new();
        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 1, &[5, 6, 7]), &mut out);
        state.handle_packet(page(1, 1, 1, &[3, 4]), &mut out);
        assert!(out.is_empty(), "descending combined list never announced");
    }

    #[tokio::test(start_paused = true)]
    async fn shrunk_list_reannounced() {
        let mut state = DiscoveryState::new();
        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 0, &[1, 2, 3]), &mut out);

        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 0, &[1, 2]), &mut out);
        assert_eq!(discovered(&out), Some(&vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_sources_coalesced() {
        let mut state = DiscoveryState::new();
        let mut out = Vec::new();
        state.handle_packet(page(1, 0, 0, &[1]), &mut out);
        state.handle_packet(page(2, 0, 0, &[2]), &mut out);
        assert_eq!(state.source_count(), 2);

        tokio::time::advance(DISCOVERY_SOURCE_TIMEOUT + Duration::from_millis(1)).await;
        let mut out = Vec::new();
        state.heartbeat(&mut out);
        assert_eq!(out.len(), 1);
        let DiscoveryEvent::SourcesLost(lost) = &out[0] else {
            panic!("expected coalesced loss");
        };
        assert_eq!(lost.len(), 2);
        assert_eq!(state.source_count(), 0);
    }
}
