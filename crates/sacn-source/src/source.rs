//! The transmit engine.
//!
//! A [`Source`] is a handle onto a dedicated worker task that owns all
//! per-universe state, the 44 Hz data tick, and the 10 s discovery
//! tick. Public methods post commands to the worker and wait for its
//! reply, so validation is synchronous for the caller while all
//! mutation stays on one task.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use sacn_protocol::frame::DiscoveryFrame;
use sacn_protocol::layout::DISCOVERY_UNIVERSES_PER_PAGE;
use sacn_protocol::{
    Interface, IpMode, Priority, SocketError, SourceName, Universe, DATA_TRANSMIT_PERIOD,
    DISCOVERY_GROUP_V4, DISCOVERY_GROUP_V6, DISCOVERY_TRANSMIT_PERIOD, SACN_PORT,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SourceError;
use crate::events::SourceEvent;
use crate::socket::TxSocket;
use crate::universe_state::{UniverseState, DIRTY_SENDS};

/// Engine configuration, fixed at construction apart from the name and
/// interface set.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Component identifier. Stable across restarts of the same
    /// logical source; the default mints a fresh one.
    pub cid: Uuid,
    pub name: SourceName,
    pub ip_mode: IpMode,
    pub interfaces: Vec<Interface>,
    /// Universe priority applied when `UniverseData` does not carry its
    /// own.
    pub priority: Priority,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            cid: Uuid::new_v4(),
            name: SourceName::default(),
            ip_mode: IpMode::Ipv4Only,
            interfaces: vec![Interface::any()],
            priority: Priority::default(),
        }
    }
}

/// Initial state for one universe.
#[derive(Debug, Clone)]
pub struct UniverseData {
    pub universe: u16,
    /// Overrides the source's default universe priority.
    pub priority: Option<Priority>,
    /// Padded with 0 beyond its length; truncated at 512.
    pub levels: Vec<u8>,
    /// Per-address priorities; presence starts the 0xDD stream. Values
    /// above 200 are replaced with the default priority.
    pub priorities: Option<Vec<u8>>,
}

impl UniverseData {
    pub fn new(universe: u16) -> Self {
        UniverseData {
            universe,
            priority: None,
            levels: Vec::new(),
            priorities: None,
        }
    }
}

enum Command {
    Start {
        should_output: bool,
        resume: bool,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    AddUniverse {
        data: UniverseData,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    RemoveUniverse {
        universe: u16,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    UpdateLevels {
        universe: u16,
        levels: Vec<u8>,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    UpdateSlot {
        universe: u16,
        slot: usize,
        level: u8,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    UpdatePriorities {
        universe: u16,
        priorities: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    UpdatePriority {
        universe: u16,
        priority: Priority,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    UpdateName {
        name: SourceName,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    UpdateInterfaces {
        interfaces: Vec<Interface>,
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    Universes {
        reply: oneshot::Sender<Vec<u16>>,
    },
}

/// Handle to a transmit engine. Cloning shares the same worker; when
/// the last handle drops, the worker terminates outstanding universes
/// and exits.
#[derive(Clone)]
pub struct Source {
    commands: mpsc::UnboundedSender<Command>,
}

impl Source {
    /// Spawn the engine worker. Must be called inside a Tokio runtime.
    pub fn new(
        config: SourceConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SourceEvent>), SourceError> {
        if config.ip_mode.includes_v6() && config.interfaces.is_empty() {
            return Err(SourceError::Ipv6RequiresInterfaces);
        }
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(config, events);
        tokio::spawn(worker.run(command_rx));
        Ok((Source { commands }, event_rx))
    }

    pub async fn start(&self, should_output: bool) -> Result<(), SourceError> {
        self.request(|reply| Command::Start {
            should_output,
            resume: false,
            reply,
        })
        .await
    }

    /// Like [`start`](Self::start), but if a stop is still flushing its
    /// terminated-packet bursts the start is deferred until they finish
    /// instead of failing with [`SourceError::Terminating`].
    pub async fn start_resuming(&self, should_output: bool) -> Result<(), SourceError> {
        self.request(|reply| Command::Start {
            should_output,
            resume: true,
            reply,
        })
        .await
    }

    /// Terminate every universe (three packets each with the Terminated
    /// bit) and close the sockets. Resolves when the bursts are done.
    pub async fn stop(&self) -> Result<(), SourceError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn add_universe(&self, data: UniverseData) -> Result<(), SourceError> {
        self.request(|reply| Command::AddUniverse { data, reply })
            .await
    }

    /// Remove a universe after its terminated-packet burst. While the
    /// engine is stopped the universe is dropped immediately.
    pub async fn remove_universe(&self, universe: u16) -> Result<(), SourceError> {
        self.request(|reply| Command::RemoveUniverse { universe, reply })
            .await
    }

    pub async fn update_levels(&self, universe: u16, levels: Vec<u8>) -> Result<(), SourceError> {
        self.request(|reply| Command::UpdateLevels {
            universe,
            levels,
            reply,
        })
        .await
    }

    pub async fn update_slot(
        &self,
        universe: u16,
        slot: usize,
        level: u8,
    ) -> Result<(), SourceError> {
        self.request(|reply| Command::UpdateSlot {
            universe,
            slot,
            level,
            reply,
        })
        .await
    }

    /// Replace the per-address-priority stream, or withdraw it with
    /// `None` so receivers fall back to the universe priority.
    pub async fn update_priorities(
        &self,
        universe: u16,
        priorities: Option<Vec<u8>>,
    ) -> Result<(), SourceError> {
        self.request(|reply| Command::UpdatePriorities {
            universe,
            priorities,
            reply,
        })
        .await
    }

    pub async fn update_priority(
        &self,
        universe: u16,
        priority: Priority,
    ) -> Result<(), SourceError> {
        self.request(|reply| Command::UpdatePriority {
            universe,
            priority,
            reply,
        })
        .await
    }

    pub async fn update_name(&self, name: &str) -> Result<(), SourceError> {
        let name = SourceName::new(name);
        self.request(|reply| Command::UpdateName { name, reply })
            .await
    }

    pub async fn update_interfaces(&self, interfaces: Vec<Interface>) -> Result<(), SourceError> {
        self.request(|reply| Command::UpdateInterfaces { interfaces, reply })
            .await
    }

    /// Universe numbers currently registered (terminating-for-removal
    /// ones excluded).
    pub async fn universes(&self) -> Result<Vec<u16>, SourceError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Universes { reply })
            .map_err(|_| SourceError::Closed)?;
        rx.await.map_err(|_| SourceError::Closed)
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), SourceError>>) -> Command,
    ) -> Result<(), SourceError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SourceError::Closed)?;
        rx.await.map_err(|_| SourceError::Closed)?
    }
}

/// Sockets of a removed interface, flushing terminated packets before
/// closing.
struct Retiring {
    socket: TxSocket,
    bursts_left: u8,
}

struct Worker {
    cid: Uuid,
    name: SourceName,
    ip_mode: IpMode,
    interfaces: Vec<Interface>,
    default_priority: Priority,
    universes: BTreeMap<u16, UniverseState>,
    sockets: Vec<TxSocket>,
    retiring: Vec<Retiring>,
    running: bool,
    should_output: bool,
    /// Replies owed once the stop-termination bursts complete.
    stopping: Vec<oneshot::Sender<Result<(), SourceError>>>,
    /// A `start_resuming` waiting for the stop to finish.
    pending_start: Option<(bool, oneshot::Sender<Result<(), SourceError>>)>,
    events: mpsc::UnboundedSender<SourceEvent>,
}

impl Worker {
    fn new(config: SourceConfig, events: mpsc::UnboundedSender<SourceEvent>) -> Self {
        Worker {
            cid: config.cid,
            name: config.name,
            ip_mode: config.ip_mode,
            interfaces: config.interfaces,
            default_priority: config.priority,
            universes: BTreeMap::new(),
            sockets: Vec::new(),
            retiring: Vec::new(),
            running: false,
            should_output: false,
            stopping: Vec::new(),
            pending_start: None,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut data_tick = tokio::time::interval(DATA_TRANSMIT_PERIOD);
        let mut discovery_tick = tokio::time::interval(DISCOVERY_TRANSMIT_PERIOD);
        data_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        self.handle_command(command, &mut data_tick, &mut discovery_tick).await;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                _ = data_tick.tick(), if self.running => {
                    self.on_data_tick(&mut data_tick, &mut discovery_tick).await;
                }
                _ = discovery_tick.tick(), if self.running && self.should_output => {
                    self.on_discovery_tick().await;
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
        data_tick: &mut Interval,
        discovery_tick: &mut Interval,
    ) {
        match command {
            Command::Start {
                should_output,
                resume,
                reply,
            } => {
                if self.running && self.stopping.is_empty() {
                    let _ = reply.send(Err(SourceError::AlreadyStarted));
                } else if self.running {
                    // Stop in flight.
                    if resume {
                        self.pending_start = Some((should_output, reply));
                    } else {
                        let _ = reply.send(Err(SourceError::Terminating));
                    }
                } else {
                    let result = self.start(should_output, data_tick, discovery_tick);
                    let _ = reply.send(result);
                }
            }
            Command::Stop { reply } => {
                if !self.running {
                    let _ = reply.send(Err(SourceError::NotStarted));
                } else {
                    self.begin_stop(reply);
                }
            }
            Command::AddUniverse { data, reply } => {
                let _ = reply.send(self.add_universe(data));
            }
            Command::RemoveUniverse { universe, reply } => {
                let _ = reply.send(self.remove_universe(universe));
            }
            Command::UpdateLevels {
                universe,
                levels,
                reply,
            } => {
                let _ = reply.send(self.with_universe(universe, |state| {
                    state.set_levels(&levels);
                    Ok(())
                }));
            }
            Command::UpdateSlot {
                universe,
                slot,
                level,
                reply,
            } => {
                let result = if slot >= sacn_protocol::UNIVERSE_SIZE {
                    Err(SourceError::InvalidSlot { slot })
                } else {
                    self.with_universe(universe, |state| {
                        state.set_slot(slot, level);
                        Ok(())
                    })
                };
                let _ = reply.send(result);
            }
            Command::UpdatePriorities {
                universe,
                priorities,
                reply,
            } => {
                let cid = self.cid;
                let name = self.name.clone();
                let _ = reply.send(self.with_universe(universe, |state| {
                    state.set_priorities(cid, &name, priorities.as_deref());
                    Ok(())
                }));
            }
            Command::UpdatePriority {
                universe,
                priority,
                reply,
            } => {
                let _ = reply.send(self.with_universe(universe, |state| {
                    state.set_universe_priority(priority);
                    Ok(())
                }));
            }
            Command::UpdateName { name, reply } => {
                self.name = name;
                for state in self.universes.values_mut() {
                    state.set_source_name(&self.name);
                }
                let _ = reply.send(Ok(()));
            }
            Command::UpdateInterfaces { interfaces, reply } => {
                let _ = reply.send(self.update_interfaces(interfaces));
            }
            Command::Universes { reply } => {
                let list = self
                    .universes
                    .iter()
                    .filter(|(_, state)| !(state.is_terminating() && state.remove_after_terminate()))
                    .map(|(number, _)| *number)
                    .collect();
                let _ = reply.send(list);
            }
        }
    }

    // -- Lifecycle --

    fn start(
        &mut self,
        should_output: bool,
        data_tick: &mut Interval,
        discovery_tick: &mut Interval,
    ) -> Result<(), SourceError> {
        if self.ip_mode.includes_v6() && self.interfaces.is_empty() {
            return Err(SourceError::Ipv6RequiresInterfaces);
        }
        let mut sockets = Vec::with_capacity(self.interfaces.len());
        for interface in &self.interfaces {
            sockets.push(TxSocket::open(self.ip_mode, interface)?);
        }
        self.sockets = sockets;
        self.running = true;
        self.should_output = should_output;
        for state in self.universes.values_mut() {
            state.revive();
        }
        data_tick.reset();
        discovery_tick.reset_immediately();
        info!(
            cid = %self.cid,
            name = %self.name,
            interfaces = self.sockets.len(),
            universes = self.universes.len(),
            "sACN source started"
        );
        let _ = self.events.send(SourceEvent::TransmissionStarted);
        Ok(())
    }

    fn begin_stop(&mut self, reply: oneshot::Sender<Result<(), SourceError>>) {
        self.stopping.push(reply);
        for state in self.universes.values_mut() {
            if !state.is_terminating() && !state.is_parked() {
                state.terminate(false);
            }
        }
        if self.universes.is_empty() {
            self.finish_stop();
        }
    }

    fn finish_stop(&mut self) {
        self.sockets.clear();
        self.retiring.clear();
        self.running = false;
        info!(cid = %self.cid, "sACN source stopped");
        let _ = self.events.send(SourceEvent::TransmissionEnded);
        for reply in self.stopping.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    /// Best-effort graceful exit when the last handle drops while the
    /// engine is still transmitting.
    async fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        for state in self.universes.values_mut() {
            if !state.is_parked() {
                state.terminate(false);
            }
        }
        let mut data_tick = tokio::time::interval(DATA_TRANSMIT_PERIOD);
        let mut discovery_tick = tokio::time::interval(DISCOVERY_TRANSMIT_PERIOD);
        for _ in 0..DIRTY_SENDS {
            self.on_data_tick(&mut data_tick, &mut discovery_tick).await;
            tokio::time::sleep(DATA_TRANSMIT_PERIOD).await;
        }
        if self.running {
            self.finish_stop();
        }
    }

    // -- Universe management --

    fn add_universe(&mut self, data: UniverseData) -> Result<(), SourceError> {
        let universe =
            Universe::new(data.universe).map_err(|_| SourceError::InvalidUniverse(data.universe))?;
        if let Some(existing) = self.universes.get(&data.universe) {
            return Err(if existing.is_terminating() {
                SourceError::UniverseTerminating(data.universe)
            } else {
                SourceError::UniverseExists(data.universe)
            });
        }
        let mut state = UniverseState::new(
            self.cid,
            &self.name,
            universe,
            data.priority.unwrap_or(self.default_priority),
            &data.levels,
            data.priorities.as_deref(),
        );
        if !self.stopping.is_empty() {
            // Stop in flight: hold the universe for the next start
            // rather than letting it block the termination bursts.
            state.park();
        }
        self.universes.insert(data.universe, state);
        debug!(universe = data.universe, "universe added");
        Ok(())
    }

    fn remove_universe(&mut self, universe: u16) -> Result<(), SourceError> {
        let state = self
            .universes
            .get_mut(&universe)
            .ok_or(SourceError::UniverseNotFound(universe))?;
        if state.is_terminating() {
            return Err(SourceError::UniverseTerminating(universe));
        }
        if self.running {
            state.terminate(true);
            debug!(universe, "universe terminating");
        } else {
            self.universes.remove(&universe);
            debug!(universe, "universe removed while stopped");
        }
        Ok(())
    }

    fn with_universe(
        &mut self,
        universe: u16,
        apply: impl FnOnce(&mut UniverseState) -> Result<(), SourceError>,
    ) -> Result<(), SourceError> {
        let state = self
            .universes
            .get_mut(&universe)
            .ok_or(SourceError::UniverseNotFound(universe))?;
        if state.is_terminating() {
            return Err(SourceError::UniverseTerminating(universe));
        }
        apply(state)
    }

    // -- Interfaces --

    fn update_interfaces(&mut self, interfaces: Vec<Interface>) -> Result<(), SourceError> {
        if self.ip_mode.includes_v6() && interfaces.is_empty() {
            return Err(SourceError::Ipv6RequiresInterfaces);
        }

        if !self.running {
            self.interfaces = interfaces;
            return Ok(());
        }

        // Open everything new before touching the active set, so a
        // failed open leaves the engine exactly as it was.
        let mut added = Vec::new();
        for interface in &interfaces {
            if !self.sockets.iter().any(|s| s.interface == *interface) {
                added.push(TxSocket::open(self.ip_mode, interface)?);
            }
        }

        let mut kept = Vec::new();
        for socket in self.sockets.drain(..) {
            if interfaces.contains(&socket.interface) {
                kept.push(socket);
            } else {
                debug!(interface = %socket.interface.name, "interface retiring");
                self.retiring.push(Retiring {
                    socket,
                    bursts_left: DIRTY_SENDS,
                });
            }
        }
        kept.extend(added);
        self.sockets = kept;
        self.interfaces = interfaces;
        Ok(())
    }

    // -- Ticks --

    async fn on_data_tick(&mut self, data_tick: &mut Interval, discovery_tick: &mut Interval) {
        let mut finished: Vec<u16> = Vec::new();
        let mut outgoing: Vec<(Universe, Vec<u8>)> = Vec::new();
        let mut retiring_outgoing: Vec<(Universe, Vec<u8>)> = Vec::new();

        for (number, state) in self.universes.iter_mut() {
            if state.is_parked() {
                continue;
            }
            let plan = state.tick();
            if plan.send_levels {
                outgoing.push((state.universe(), state.levels_frame().as_bytes().to_vec()));
            }
            if plan.send_priorities {
                if let Some(frame) = state.priorities_frame() {
                    outgoing.push((state.universe(), frame.as_bytes().to_vec()));
                }
            }
            if plan.finished_terminating {
                finished.push(*number);
            }
            if !self.retiring.is_empty() {
                retiring_outgoing.push((state.universe(), state.terminated_snapshot()));
            }
        }

        for (universe, bytes) in &outgoing {
            self.send_universe(*universe, bytes).await;
        }

        if !self.retiring.is_empty() {
            for (universe, bytes) in &retiring_outgoing {
                for retiring in &self.retiring {
                    send_on(&retiring.socket, *universe, bytes).await;
                }
            }
            for retiring in &mut self.retiring {
                retiring.bursts_left -= 1;
            }
            self.retiring.retain(|r| {
                if r.bursts_left == 0 {
                    debug!(interface = %r.socket.interface.name, "retired interface closed");
                }
                r.bursts_left > 0
            });
        }

        for number in finished {
            let remove = self
                .universes
                .get(&number)
                .map(|s| s.remove_after_terminate())
                .unwrap_or(false);
            if remove {
                self.universes.remove(&number);
                debug!(universe = number, "universe removed after termination");
            } else if let Some(state) = self.universes.get_mut(&number) {
                state.park();
            }
        }

        if !self.stopping.is_empty() && self.universes.values().all(UniverseState::is_parked) {
            self.finish_stop();
            if let Some((should_output, reply)) = self.pending_start.take() {
                let result = self.start(should_output, data_tick, discovery_tick);
                let _ = reply.send(result);
            }
        }
    }

    async fn on_discovery_tick(&mut self) {
        let universes: Vec<Universe> = self
            .universes
            .values()
            .filter(|state| !state.is_terminating() && !state.is_parked())
            .map(|state| state.universe())
            .collect();

        let pages = universes.chunks(DISCOVERY_UNIVERSES_PER_PAGE);
        let last_page = pages.len().saturating_sub(1) as u8;
        let frames: Vec<DiscoveryFrame> = if universes.is_empty() {
            vec![DiscoveryFrame::new(self.cid, &self.name, 0, 0, &[])]
        } else {
            pages
                .enumerate()
                .map(|(page, chunk)| {
                    DiscoveryFrame::new(self.cid, &self.name, page as u8, last_page, chunk)
                })
                .collect()
        };

        for frame in &frames {
            for socket in &self.sockets {
                if let Some(v4) = &socket.v4 {
                    let dest = SocketAddr::new(IpAddr::V4(DISCOVERY_GROUP_V4), SACN_PORT);
                    if let Err(error) = v4.send_to(frame.as_bytes(), dest).await {
                        warn!(%error, interface = %socket.interface.name, "discovery send failed");
                    }
                }
                if let Some(v6) = &socket.v6 {
                    let dest = SocketAddr::new(IpAddr::V6(DISCOVERY_GROUP_V6), SACN_PORT);
                    if let Err(error) = v6.send_to(frame.as_bytes(), dest).await {
                        warn!(%error, interface = %socket.interface.name, "discovery send failed");
                    }
                }
            }
        }
        debug!(pages = frames.len(), "universe discovery transmitted");
    }

    async fn send_universe(&mut self, universe: Universe, bytes: &[u8]) {
        let mut dropped: Vec<usize> = Vec::new();
        for (idx, socket) in self.sockets.iter_mut().enumerate() {
            match send_on(socket, universe, bytes).await {
                None => socket.failures = 0,
                Some(error) => {
                    socket.failures += 1;
                    if socket.failures >= 3 {
                        warn!(
                            interface = %socket.interface.name,
                            %error,
                            "transmit socket dropped after repeated send failures"
                        );
                        let _ = self.events.send(SourceEvent::SocketClosed {
                            interface: socket.interface.name.clone(),
                            error: SocketError::Send { source: error },
                        });
                        dropped.push(idx);
                    }
                }
            }
        }
        for idx in dropped.into_iter().rev() {
            self.sockets.remove(idx);
        }
    }
}

/// Send one datagram to the universe's group on every family the socket
/// carries. Returns the first hard send error, if any.
async fn send_on(socket: &TxSocket, universe: Universe, bytes: &[u8]) -> Option<std::io::Error> {
    let mut failure = None;
    if let Some(v4) = &socket.v4 {
        let dest = SocketAddr::new(IpAddr::V4(universe.multicast_ipv4()), SACN_PORT);
        if let Err(error) = v4.send_to(bytes, dest).await {
            warn!(%error, universe = universe.get(), "IPv4 send failed");
            failure = Some(error);
        }
    }
    if let Some(v6) = &socket.v6 {
        let dest = SocketAddr::new(IpAddr::V6(universe.multicast_ipv6()), SACN_PORT);
        if let Err(error) = v6.send_to(bytes, dest).await {
            warn!(%error, universe = universe.get(), "IPv6 send failed");
            failure = failure.or(Some(error));
        }
    }
    failure
}
