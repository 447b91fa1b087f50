//! Per-universe raw receiver.
//!
//! Demultiplexes data datagrams into per-source state machines:
//! sequence filtering, identity binding, the per-address-priority
//! discovery window, sampling adoption, and loss detection. All
//! protocol state lives in [`RawState`], which never touches a socket,
//! so the whole machine runs under a paused test clock; the worker
//! around it owns sockets, the 500 ms loss heartbeat, and the sampling
//! timer.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use sacn_protocol::packet::{Packet, StartCode};
use sacn_protocol::sequence::sequence_acceptable;
use sacn_protocol::{
    Interface, IpFamily, IpMode, SourceName, Universe, LOSS_HEARTBEAT_PERIOD, PAP_WAIT_TIMEOUT,
    SAMPLING_PERIOD, SOURCE_LOSS_TIMEOUT,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::ReceiverError;
use crate::events::{RawReceiverEvent, SourceData};
use crate::socket::{ReaderMessage, RxSocket};

/// Default cap on simultaneously tracked sources.
pub const DEFAULT_SOURCE_LIMIT: usize = 4;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub universe: u16,
    pub ip_mode: IpMode,
    pub interfaces: Vec<Interface>,
    /// `None` lifts the cap entirely.
    pub source_limit: Option<usize>,
    /// Discard datagrams carrying the Preview bit.
    pub filter_preview: bool,
}

impl ReceiverConfig {
    pub fn new(universe: u16) -> Self {
        ReceiverConfig {
            universe,
            ip_mode: IpMode::Ipv4Only,
            interfaces: vec![Interface::any()],
            source_limit: Some(DEFAULT_SOURCE_LIMIT),
            filter_preview: true,
        }
    }
}

// -- Per-source state machine --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    /// Nothing usable yet; a PAP stream may already be arriving.
    WaitingLevels,
    /// Levels seen; holding them back while the PAP window runs.
    WaitingPap,
    /// Levels-only source.
    HasLevels,
    /// Levels plus a live 0xDD stream.
    HasLevelsAndPap,
}

struct SourceTracker {
    host: IpAddr,
    family: IpFamily,
    name: SourceName,
    last_sequence: u8,
    state: TrackState,
    terminated: bool,
    is_sampling: bool,
    /// Data-loss deadline, pushed out by every accepted datagram.
    packet_deadline: Instant,
    /// End of the PAP wait window while in `WaitingPap`.
    pap_wait_deadline: Instant,
    /// PAP-stream loss deadline; `None` while no 0xDD packet has been
    /// seen.
    pap_deadline: Option<Instant>,
}

/// All protocol state of one universe's receiver.
pub(crate) struct RawState {
    universe: u16,
    source_limit: Option<usize>,
    filter_preview: bool,
    sampling_active: bool,
    limit_notified: bool,
    sources: HashMap<Uuid, SourceTracker>,
}

impl RawState {
    pub fn new(universe: u16, source_limit: Option<usize>, filter_preview: bool) -> Self {
        RawState {
            universe,
            source_limit,
            filter_preview,
            sampling_active: false,
            limit_notified: false,
            sources: HashMap::new(),
        }
    }

    pub fn begin_sampling(&mut self) {
        self.sampling_active = true;
    }

    pub fn end_sampling(&mut self) {
        self.sampling_active = false;
        for tracker in self.sources.values_mut() {
            tracker.is_sampling = false;
        }
    }

    pub fn reset(&mut self) {
        self.sources.clear();
        self.sampling_active = false;
        self.limit_notified = false;
    }

    /// Feed one datagram through parsing and the per-source machine,
    /// appending any notifications to `out`.
    pub fn handle_datagram(
        &mut self,
        bytes: &[u8],
        source_addr: SocketAddr,
        family: IpFamily,
        out: &mut Vec<RawReceiverEvent>,
    ) {
        let packet = match Packet::parse(bytes) {
            Ok(Packet::Data(data)) => data,
            // Discovery traffic has its own receiver; anything else on
            // this port is logged and dropped.
            Ok(Packet::Discovery(_)) => return,
            Err(error) => {
                debug!(%error, from = %source_addr, "dropping unparseable datagram");
                return;
            }
        };

        if packet.universe.get() != self.universe {
            return;
        }
        if packet.preview && self.filter_preview {
            trace!(cid = %packet.cid, "preview datagram filtered");
            return;
        }

        let now = Instant::now();
        let cid = packet.cid;
        let host = source_addr.ip();

        let known = self.sources.contains_key(&cid);
        if !known {
            if packet.terminated {
                return;
            }
            if let Some(limit) = self.source_limit {
                if self.sources.len() >= limit {
                    if !self.limit_notified {
                        self.limit_notified = true;
                        warn!(universe = self.universe, limit, "source limit exceeded");
                        out.push(RawReceiverEvent::SourceLimitExceeded);
                    }
                    return;
                }
            }
            debug!(cid = %cid, universe = self.universe, from = %host, "new source");
            self.sources.insert(
                cid,
                SourceTracker {
                    host,
                    family,
                    name: packet.source_name.clone(),
                    last_sequence: packet.sequence,
                    state: TrackState::WaitingLevels,
                    terminated: false,
                    is_sampling: self.sampling_active,
                    packet_deadline: now + SOURCE_LOSS_TIMEOUT,
                    pap_wait_deadline: now,
                    pap_deadline: None,
                },
            );
        }

        let tracker = self.sources.get_mut(&cid).expect("tracked above");
        if known {
            // First sighting fixed the identity; a multi-homed device
            // talking from elsewhere is ignored.
            if tracker.host != host || tracker.family != family {
                return;
            }
            if tracker.terminated {
                return;
            }
            if !sequence_acceptable(tracker.last_sequence, packet.sequence) {
                trace!(
                    cid = %cid,
                    prev = tracker.last_sequence,
                    next = packet.sequence,
                    "out-of-order datagram dropped"
                );
                return;
            }
        }

        tracker.last_sequence = packet.sequence;
        tracker.name = packet.source_name.clone();
        tracker.packet_deadline = now + SOURCE_LOSS_TIMEOUT;

        if packet.terminated {
            debug!(cid = %cid, "source terminated its stream");
            tracker.terminated = true;
            // Expire on the next heartbeat.
            tracker.packet_deadline = now;
            return;
        }

        let data = SourceData {
            cid,
            name: tracker.name.clone(),
            universe: self.universe,
            priority: packet.priority,
            start_code: packet.start_code,
            values: packet.values,
            is_sampling: tracker.is_sampling,
        };

        match packet.start_code {
            StartCode::Levels => match tracker.state {
                TrackState::WaitingLevels => {
                    if tracker.is_sampling {
                        // Sampling adopts immediately, skipping the PAP
                        // wait.
                        tracker.state = TrackState::HasLevelsAndPap;
                        out.push(RawReceiverEvent::UniverseData(data));
                    } else {
                        tracker.state = TrackState::WaitingPap;
                        tracker.pap_wait_deadline = now + PAP_WAIT_TIMEOUT;
                    }
                }
                TrackState::WaitingPap => {
                    if now >= tracker.pap_wait_deadline {
                        tracker.state = TrackState::HasLevels;
                        out.push(RawReceiverEvent::UniverseData(data));
                    }
                }
                TrackState::HasLevels => {
                    out.push(RawReceiverEvent::UniverseData(data));
                }
                TrackState::HasLevelsAndPap => {
                    if tracker.pap_deadline.is_some_and(|deadline| now >= deadline) {
                        tracker.state = TrackState::HasLevels;
                        tracker.pap_deadline = None;
                        out.push(RawReceiverEvent::SourcePapLost(cid));
                    }
                    out.push(RawReceiverEvent::UniverseData(data));
                }
            },
            StartCode::PerAddressPriority => {
                match tracker.state {
                    TrackState::WaitingLevels => {
                        // Still waiting for the first levels; remember
                        // the stream is alive.
                    }
                    TrackState::WaitingPap | TrackState::HasLevels => {
                        tracker.state = TrackState::HasLevelsAndPap;
                    }
                    TrackState::HasLevelsAndPap => {}
                }
                tracker.pap_deadline = Some(now + SOURCE_LOSS_TIMEOUT);
                out.push(RawReceiverEvent::UniverseData(data));
            }
        }
    }

    /// 500 ms loss scan: evict sources whose data stream went quiet,
    /// coalescing the announced ones into a single event.
    pub fn heartbeat(&mut self, out: &mut Vec<RawReceiverEvent>) {
        let now = Instant::now();
        let mut lost = Vec::new();
        self.sources.retain(|cid, tracker| {
            if now < tracker.packet_deadline {
                return true;
            }
            match tracker.state {
                // Never produced data: evicted silently.
                TrackState::WaitingLevels | TrackState::WaitingPap => {
                    debug!(cid = %cid, "silent eviction of waiting source");
                }
                TrackState::HasLevels | TrackState::HasLevelsAndPap => {
                    lost.push(*cid);
                }
            }
            false
        });
        if let Some(limit) = self.source_limit {
            if self.sources.len() < limit {
                self.limit_notified = false;
            }
        }
        if !lost.is_empty() {
            debug!(count = lost.len(), universe = self.universe, "sources lost");
            out.push(RawReceiverEvent::SourcesLost(lost));
        }
    }

    #[cfg(test)]
    fn source_count(&self) -> usize {
        self.sources.len()
    }
}

// -- Worker and handle --

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

/// Handle to one universe's raw receiver worker.
#[derive(Clone)]
pub struct RawReceiver {
    commands: mpsc::UnboundedSender<Command>,
}

impl RawReceiver {
    /// Validate the configuration and spawn the worker. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        config: ReceiverConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RawReceiverEvent>), ReceiverError> {
        let universe = Universe::new(config.universe)
            .map_err(|_| ReceiverError::InvalidUniverse(config.universe))?;
        if config.ip_mode.includes_v6() && config.interfaces.is_empty() {
            return Err(ReceiverError::Ipv6RequiresInterfaces);
        }
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            universe,
            ip_mode: config.ip_mode,
            interfaces: config.interfaces,
            state: RawState::new(
                config.universe,
                config.source_limit,
                config.filter_preview,
            ),
            sockets: Vec::new(),
            datagram_tx,
            events,
            running: false,
            cancel: CancellationToken::new(),
            sampling_armed: false,
            sampling_pending: HashSet::new(),
        };
        tokio::spawn(worker.run(command_rx, datagram_rx));
        Ok((RawReceiver { commands }, event_rx))
    }

    /// Bind and join on every configured interface and begin the
    /// sampling period.
    pub async fn start(&self) -> Result<(), ReceiverError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Close sockets and drop all tracked sources.
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
    universe: Universe,
    ip_mode: IpMode,
    interfaces: Vec<Interface>,
    state: RawState,
    sockets: Vec<RxSocket>,
    datagram_tx: mpsc::UnboundedSender<ReaderMessage>,
    events: mpsc::UnboundedSender<RawReceiverEvent>,
    running: bool,
    cancel: CancellationToken,
    sampling_armed: bool,
    /// Interfaces added while a sampling window was open; they get a
    /// fresh window when the current one fires.
    sampling_pending: HashSet<String>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut datagrams: mpsc::UnboundedReceiver<ReaderMessage>,
    ) {
        let mut heartbeat = tokio::time::interval(LOSS_HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sampling_timer = Box::pin(tokio::time::sleep(SAMPLING_PERIOD));

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { reply }) => {
                        let result = self.start(&mut sampling_timer);
                        let _ = reply.send(result);
                    }
                    Some(Command::Stop { reply }) => {
                        let result = self.stop();
                        let _ = reply.send(result);
                    }
                    Some(Command::UpdateInterfaces { interfaces, reply }) => {
                        let result = self.update_interfaces(interfaces, &mut sampling_timer);
                        let _ = reply.send(result);
                    }
                    None => {
                        self.cancel.cancel();
                        return;
                    }
                },
                Some(message) = datagrams.recv(), if self.running => match message {
                    ReaderMessage::Datagram(datagram) => {
                        let mut out = Vec::new();
                        self.state.handle_datagram(
                            &datagram.bytes,
                            datagram.source,
                            datagram.family,
                            &mut out,
                        );
                        self.emit(out);
                    }
                    ReaderMessage::Closed { interface, error } => {
                        let _ = self.events.send(RawReceiverEvent::SocketClosed {
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
                    self.emit(out);
                }
                () = sampling_timer.as_mut(), if self.sampling_armed => {
                    self.on_sampling_fire(&mut sampling_timer);
                }
            }
        }
    }

    fn start(
        &mut self,
        sampling_timer: &mut std::pin::Pin<Box<tokio::time::Sleep>>,
    ) -> Result<(), ReceiverError> {
        if self.running {
            return Err(ReceiverError::AlreadyStarted);
        }
        self.cancel = CancellationToken::new();
        let mut sockets = Vec::with_capacity(self.interfaces.len());
        for interface in &self.interfaces {
            sockets.push(RxSocket::open(
                self.ip_mode,
                interface,
                &[self.universe.multicast_ipv4()],
                &[self.universe.multicast_ipv6()],
                self.datagram_tx.clone(),
                &self.cancel,
            )?);
        }
        self.sockets = sockets;
        self.running = true;
        self.state.begin_sampling();
        self.sampling_armed = true;
        sampling_timer.as_mut().reset(Instant::now() + SAMPLING_PERIOD);
        debug!(universe = self.universe.get(), "raw receiver started, sampling");
        let _ = self.events.send(RawReceiverEvent::SamplingStarted);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ReceiverError> {
        if !self.running {
            return Err(ReceiverError::NotStarted);
        }
        self.cancel.cancel();
        self.sockets.clear();
        self.running = false;
        self.sampling_armed = false;
        self.sampling_pending.clear();
        self.state.reset();
        debug!(universe = self.universe.get(), "raw receiver stopped");
        Ok(())
    }

    fn update_interfaces(
        &mut self,
        interfaces: Vec<Interface>,
        sampling_timer: &mut std::pin::Pin<Box<tokio::time::Sleep>>,
    ) -> Result<(), ReceiverError> {
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
                    &[self.universe.multicast_ipv4()],
                    &[self.universe.multicast_ipv6()],
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

        // Fresh sockets have not observed the wire yet: they sample.
        if !added.is_empty() {
            if self.sampling_armed {
                self.sampling_pending
                    .extend(added.iter().map(|s| s.interface.name.clone()));
            } else {
                self.state.begin_sampling();
                self.sampling_armed = true;
                sampling_timer.as_mut().reset(Instant::now() + SAMPLING_PERIOD);
                let _ = self.events.send(RawReceiverEvent::SamplingStarted);
            }
        }
        self.sockets.extend(added);
        self.interfaces = interfaces;
        Ok(())
    }

    fn on_sampling_fire(&mut self, sampling_timer: &mut std::pin::Pin<Box<tokio::time::Sleep>>) {
        if !self.sampling_pending.is_empty() {
            // Sockets joined mid-window: give them a full window of
            // their own before declaring sampling over.
            self.sampling_pending.clear();
            sampling_timer.as_mut().reset(Instant::now() + SAMPLING_PERIOD);
            return;
        }
        self.sampling_armed = false;
        self.state.end_sampling();
        debug!(universe = self.universe.get(), "sampling ended");
        let _ = self.events.send(RawReceiverEvent::SamplingEnded);
    }

    fn emit(&self, out: Vec<RawReceiverEvent>) {
        for event in out {
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sacn_protocol::frame::DataFrame;
    use sacn_protocol::{Priority, UNIVERSE_SIZE};
    use std::time::Duration;

    fn cid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 5568))
    }

    fn levels_bytes(cid: Uuid, sequence: u8, levels: &[u8]) -> Vec<u8> {
        let mut padded = [0u8; UNIVERSE_SIZE];
        padded[..levels.len()].copy_from_slice(levels);
        let mut frame = DataFrame::new(
            cid,
            &SourceName::new("test source"),
            Priority::default(),
            Universe::new(1).unwrap(),
            StartCode::Levels,
            &padded,
        );
        frame.set_sequence(sequence);
        frame.as_bytes().to_vec()
    }

    fn pap_bytes(cid: Uuid, sequence: u8, priorities: &[u8]) -> Vec<u8> {
        let mut padded = [0u8; UNIVERSE_SIZE];
        padded[..priorities.len()].copy_from_slice(priorities);
        let mut frame = DataFrame::new(
            cid,
            &SourceName::new("test source"),
            Priority::default(),
            Universe::new(1).unwrap(),
            StartCode::PerAddressPriority,
            &padded,
        );
        frame.set_sequence(sequence);
        frame.as_bytes().to_vec()
    }

    fn feed(state: &mut RawState, bytes: &[u8]) -> Vec<RawReceiverEvent> {
        let mut out = Vec::new();
        state.handle_datagram(bytes, addr(1), IpFamily::V4, &mut out);
        out
    }

    fn data_events(events: &[RawReceiverEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, RawReceiverEvent::UniverseData(_)))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_source_notifies_immediately() {
        let mut state = RawState::new(1, Some(4), true);
        state.begin_sampling();

        let events = feed(&mut state, &levels_bytes(cid(1), 0, &[255]));
        assert_eq!(data_events(&events), 1);
        let RawReceiverEvent::UniverseData(data) = &events[0] else {
            panic!("expected data event");
        };
        assert!(data.is_sampling);
    }

    #[tokio::test(start_paused = true)]
    async fn live_source_waits_out_pap_window() {
        let mut state = RawState::new(1, Some(4), true);

        // First levels start the PAP window silently.
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 0, &[255]))), 0);
        // Still inside the window: quiet.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 1, &[255]))), 0);
        // Window over: levels flow.
        tokio::time::advance(PAP_WAIT_TIMEOUT).await;
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 2, &[255]))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pap_arrival_ends_waiting() {
        let mut state = RawState::new(1, Some(4), true);

        feed(&mut state, &levels_bytes(cid(1), 0, &[255]));
        let events = feed(&mut state, &pap_bytes(cid(1), 1, &[200]));
        assert_eq!(data_events(&events), 1);
        // Levels flow from now on.
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 2, &[255]))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_regression_dropped() {
        let mut state = RawState::new(1, Some(4), true);
        state.begin_sampling();

        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 5, &[1]))), 1);
        // delta -1: dropped.
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 4, &[2]))), 0);
        // delta -21 from 5: wraparound, accepted.
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 240, &[3]))), 1);
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 241, &[4]))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identity_binding_ignores_other_hosts() {
        let mut state = RawState::new(1, Some(4), true);
        state.begin_sampling();

        let mut out = Vec::new();
        state.handle_datagram(&levels_bytes(cid(1), 0, &[1]), addr(1), IpFamily::V4, &mut out);
        assert_eq!(data_events(&out), 1);

        // Same CID from a different host: silently ignored.
        let mut out = Vec::new();
        state.handle_datagram(&levels_bytes(cid(1), 1, &[2]), addr(2), IpFamily::V4, &mut out);
        assert!(out.is_empty());
        assert_eq!(state.source_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pap_loss_falls_back_to_levels_only() {
        let mut state = RawState::new(1, Some(4), true);
        state.begin_sampling();
        state.end_sampling();

        // Live source with levels + PAP.
        feed(&mut state, &levels_bytes(cid(1), 0, &[1]));
        feed(&mut state, &pap_bytes(cid(1), 1, &[100]));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 2, &[1]))), 1);

        // PAP stream stops; levels keep coming past the PAP deadline.
        tokio::time::advance(SOURCE_LOSS_TIMEOUT).await;
        let events = feed(&mut state, &levels_bytes(cid(1), 3, &[1]));
        assert!(events
            .iter()
            .any(|e| matches!(e, RawReceiverEvent::SourcePapLost(c) if *c == cid(1))));
        assert_eq!(data_events(&events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn source_loss_coalesced_on_heartbeat() {
        let mut state = RawState::new(1, Some(4), true);
        state.begin_sampling();

        feed(&mut state, &levels_bytes(cid(1), 0, &[1]));
        let mut out = Vec::new();
        state.handle_datagram(&levels_bytes(cid(2), 0, &[2]), addr(3), IpFamily::V4, &mut out);
        assert_eq!(state.source_count(), 2);

        tokio::time::advance(SOURCE_LOSS_TIMEOUT + Duration::from_millis(1)).await;
        let mut out = Vec::new();
        state.heartbeat(&mut out);
        assert_eq!(out.len(), 1);
        let RawReceiverEvent::SourcesLost(lost) = &out[0] else {
            panic!("expected coalesced loss event");
        };
        assert_eq!(lost.len(), 2);
        assert_eq!(state.source_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_sources_evicted_silently() {
        let mut state = RawState::new(1, Some(4), true);

        // Not sampling: the source stays in the PAP wait and then dies.
        feed(&mut state, &levels_bytes(cid(1), 0, &[1]));
        tokio::time::advance(SOURCE_LOSS_TIMEOUT + Duration::from_millis(1)).await;
        let mut out = Vec::new();
        state.heartbeat(&mut out);
        assert!(out.is_empty());
        assert_eq!(state.source_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_stream_drops_source() {
        let mut state = RawState::new(1, Some(4), true);
        state.begin_sampling();

        feed(&mut state, &levels_bytes(cid(1), 0, &[1]));

        let mut bytes = levels_bytes(cid(1), 1, &[1]);
        bytes[sacn_protocol::layout::OPTIONS_OFFSET] |= sacn_protocol::layout::OPTION_TERMINATED;
        assert_eq!(data_events(&feed(&mut state, &bytes)), 0);

        // Later datagrams from the same CID are ignored.
        assert_eq!(data_events(&feed(&mut state, &levels_bytes(cid(1), 2, &[1]))), 0);

        // Next heartbeat announces the loss.
        let mut out = Vec::new();
        state.heartbeat(&mut out);
        assert!(matches!(&out[0], RawReceiverEvent::SourcesLost(l) if l == &vec![cid(1)]));
    }

    #[tokio::test(start_paused = true)]
    async fn source_limit_announced_once() {
        let mut state = RawState::new(1, Some(1), true);
        state.begin_sampling();

        feed(&mut state, &levels_bytes(cid(1), 0, &[1]));

        let mut out = Vec::new();
        state.handle_datagram(&levels_bytes(cid(2), 0, &[2]), addr(3), IpFamily::V4, &mut out);
        assert!(matches!(out[0], RawReceiverEvent::SourceLimitExceeded));

        // Second overflow stays quiet.
        let mut out = Vec::new();
        state.handle_datagram(&levels_bytes(cid(3), 0, &[3]), addr(4), IpFamily::V4, &mut out);
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn preview_datagrams_filtered() {
        let mut state = RawState::new(1, Some(4), true);
        state.begin_sampling();

        let mut bytes = levels_bytes(cid(1), 0, &[1]);
        bytes[sacn_protocol::layout::OPTIONS_OFFSET] |= sacn_protocol::layout::OPTION_PREVIEW;
        assert!(feed(&mut state, &bytes).is_empty());
        assert_eq!(state.source_count(), 0);

        let mut unfiltered = RawState::new(1, Some(4), false);
        unfiltered.begin_sampling();
        let mut out = Vec::new();
        unfiltered.handle_datagram(&bytes, addr(1), IpFamily::V4, &mut out);
        assert_eq!(data_events(&out), 1);
    }
}
