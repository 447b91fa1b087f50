//! Merged receiver: raw receiver output routed into two mergers.
//!
//! Sources still inside the sampling window accumulate in the sampling
//! merger so a console that was already transmitting when we started
//! does not flash through partial states; everyone else feeds the live
//! merger. When sampling ends, sampled sources migrate atomically into
//! the live merger. Merged-frame notifications only fire while no
//! source is still waiting for its first levels packet.

use std::collections::{HashMap, HashSet};

use sacn_protocol::merge::Merger;
use sacn_protocol::packet::StartCode;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ReceiverError;
use crate::events::{RawReceiverEvent, ReceiverEvent, SourceData};
use crate::raw::{RawReceiver, ReceiverConfig};
use sacn_protocol::Interface;

/// Routing and merge state for one universe. Socket-free; driven by
/// raw-receiver events.
pub(crate) struct MergedState {
    universe: u16,
    sampling: Merger,
    live: Merger,
    /// Sources whose first packet was PAP; merged output is withheld
    /// until their levels arrive.
    pending: HashSet<Uuid>,
    sampling_active: bool,
}

impl MergedState {
    pub fn new(universe: u16) -> Self {
        MergedState {
            universe,
            sampling: Merger::new(),
            live: Merger::new(),
            pending: HashSet::new(),
            sampling_active: false,
        }
    }

    pub fn handle_raw_event(&mut self, event: RawReceiverEvent, out: &mut Vec<ReceiverEvent>) {
        match event {
            RawReceiverEvent::SamplingStarted => {
                self.sampling_active = true;
                out.push(ReceiverEvent::SamplingStarted);
            }
            RawReceiverEvent::SamplingEnded => {
                self.migrate_sampled_sources();
                self.sampling_active = false;
                out.push(ReceiverEvent::SamplingEnded);
                self.notify_merged(out);
            }
            RawReceiverEvent::UniverseData(data) => {
                let to_live = self.apply_data(&data);
                if to_live {
                    self.notify_merged(out);
                }
            }
            RawReceiverEvent::SourcesLost(lost) => {
                for cid in &lost {
                    let _ = self.sampling.remove_source(cid);
                    let _ = self.live.remove_source(cid);
                    self.pending.remove(cid);
                }
                out.push(ReceiverEvent::SourcesLost(lost));
                self.notify_merged(out);
            }
            RawReceiverEvent::SourcePapLost(cid) => {
                if self.live.contains_source(&cid) {
                    let _ = self.live.remove_pap(&cid);
                    self.notify_merged(out);
                } else if self.sampling.contains_source(&cid) {
                    let _ = self.sampling.remove_pap(&cid);
                }
            }
            RawReceiverEvent::SourceLimitExceeded => {
                out.push(ReceiverEvent::SourceLimitExceeded);
            }
            RawReceiverEvent::SocketClosed { interface, error } => {
                out.push(ReceiverEvent::SocketClosed { interface, error });
            }
        }
    }

    /// Route one datagram into the right merger. Returns true when the
    /// live merger changed.
    fn apply_data(&mut self, data: &SourceData) -> bool {
        let to_sampling = data.is_sampling && self.sampling_active;
        let merger = if to_sampling {
            &mut self.sampling
        } else {
            &mut self.live
        };

        if !merger.contains_source(&data.cid) {
            let _ = merger.add_source(data.cid);
            if data.start_code == StartCode::PerAddressPriority {
                self.pending.insert(data.cid);
            }
        }

        match data.start_code {
            StartCode::Levels => {
                let _ = merger.update_universe_priority(&data.cid, data.priority);
                if let Err(error) = merger.update_levels(&data.cid, &data.values) {
                    warn!(%error, cid = %data.cid, "levels rejected by merger");
                }
                self.pending.remove(&data.cid);
            }
            StartCode::PerAddressPriority => {
                if let Err(error) = merger.update_pap(&data.cid, &data.values) {
                    warn!(%error, cid = %data.cid, "priorities rejected by merger");
                }
                // The framing priority rides along on the 0xDD stream
                // too; record it for when the PAP stream falls away.
                let _ = merger.update_universe_priority(&data.cid, data.priority);
            }
        }
        !to_sampling
    }

    /// Move every sampled source's inputs into the live merger in one
    /// step, so downstream never sees a half-migrated universe.
    fn migrate_sampled_sources(&mut self) {
        for cid in self.sampling.active_sources() {
            let Some(snapshot) = self.sampling.source_snapshot(&cid) else {
                continue;
            };
            if !self.live.contains_source(&cid) {
                let _ = self.live.add_source(cid);
            }
            if let Some(priority) = snapshot.universe_priority {
                let _ = self.live.update_universe_priority(&cid, priority);
            }
            let _ = self.live.update_levels(&cid, &snapshot.levels);
            if let Some(pap) = &snapshot.per_address_priorities {
                let _ = self.live.update_pap(&cid, pap);
            }
            let _ = self.sampling.remove_source(&cid);
        }
        debug!(universe = self.universe, sources = self.live.source_count(), "sampling migration done");
    }

    fn notify_merged(&self, out: &mut Vec<ReceiverEvent>) {
        if self.sampling_active || self.live.source_count() == 0 {
            return;
        }
        if self.pending.iter().any(|cid| self.live.contains_source(cid)) {
            return;
        }
        out.push(ReceiverEvent::MergedData {
            universe: self.universe,
            levels: Box::new(*self.live.levels()),
            winners: self.live.winners(),
            active_sources: self.live.active_sources(),
        });
    }
}

/// One universe's merged receiver: a [`RawReceiver`] plus the
/// sampling/live merger pair, surfacing [`ReceiverEvent`]s.
#[derive(Clone)]
pub struct Receiver {
    raw: RawReceiver,
    universe: u16,
}

impl Receiver {
    /// Validate the configuration, spawn the raw receiver and the merge
    /// task. Must be called inside a Tokio runtime.
    pub fn new(
        config: ReceiverConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ReceiverEvent>), ReceiverError> {
        let universe = config.universe;
        let (raw, mut raw_events) = RawReceiver::new(config)?;
        let (events, event_rx) = mpsc::unbounded_channel();

        let mut state = MergedState::new(universe);
        tokio::spawn(async move {
            while let Some(event) = raw_events.recv().await {
                let mut out = Vec::new();
                state.handle_raw_event(event, &mut out);
                for event in out {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
        });

        Ok((Receiver { raw, universe }, event_rx))
    }

    pub fn universe(&self) -> u16 {
        self.universe
    }

    pub async fn start(&self) -> Result<(), ReceiverError> {
        self.raw.start().await
    }

    pub async fn stop(&self) -> Result<(), ReceiverError> {
        self.raw.stop().await
    }

    pub async fn update_interfaces(&self, interfaces: Vec<Interface>) -> Result<(), ReceiverError> {
        self.raw.update_interfaces(interfaces).await
    }
}

/// Uniform configuration for a set of per-universe receivers.
#[derive(Debug, Clone)]
pub struct ReceiverGroupConfig {
    pub ip_mode: sacn_protocol::IpMode,
    pub interfaces: Vec<Interface>,
    pub source_limit: Option<usize>,
    pub filter_preview: bool,
}

impl Default for ReceiverGroupConfig {
    fn default() -> Self {
        ReceiverGroupConfig {
            ip_mode: sacn_protocol::IpMode::Ipv4Only,
            interfaces: vec![Interface::any()],
            source_limit: Some(crate::raw::DEFAULT_SOURCE_LIMIT),
            filter_preview: true,
        }
    }
}

/// Manages one [`Receiver`] per universe, funnelling every event onto a
/// single channel tagged with its universe number.
pub struct ReceiverGroup {
    config: ReceiverGroupConfig,
    receivers: HashMap<u16, Receiver>,
    events: mpsc::UnboundedSender<(u16, ReceiverEvent)>,
}

impl ReceiverGroup {
    pub fn new(
        config: ReceiverGroupConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(u16, ReceiverEvent)>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            ReceiverGroup {
                config,
                receivers: HashMap::new(),
                events,
            },
            event_rx,
        )
    }

    /// Create and start a receiver for one more universe.
    pub async fn add_universe(&mut self, universe: u16) -> Result<(), ReceiverError> {
        if self.receivers.contains_key(&universe) {
            return Err(ReceiverError::UniverseExists(universe));
        }
        let config = ReceiverConfig {
            universe,
            ip_mode: self.config.ip_mode,
            interfaces: self.config.interfaces.clone(),
            source_limit: self.config.source_limit,
            filter_preview: self.config.filter_preview,
        };
        let (receiver, mut events) = Receiver::new(config)?;
        let forward = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if forward.send((universe, event)).is_err() {
                    return;
                }
            }
        });
        receiver.start().await?;
        self.receivers.insert(universe, receiver);
        Ok(())
    }

    /// Stop and drop one universe's receiver.
    pub async fn remove_universe(&mut self, universe: u16) -> Result<(), ReceiverError> {
        let receiver = self
            .receivers
            .remove(&universe)
            .ok_or(ReceiverError::UniverseNotFound(universe))?;
        receiver.stop().await
    }

    pub fn universes(&self) -> Vec<u16> {
        let mut universes: Vec<u16> = self.receivers.keys().copied().collect();
        universes.sort_unstable();
        universes
    }

    /// Apply a new interface set to every receiver in the group.
    pub async fn update_interfaces(&mut self, interfaces: Vec<Interface>) -> Result<(), ReceiverError> {
        for receiver in self.receivers.values() {
            receiver.update_interfaces(interfaces.clone()).await?;
        }
        self.config.interfaces = interfaces;
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        for (universe, receiver) in self.receivers.drain() {
            if let Err(error) = receiver.stop().await {
                debug!(%error, universe, "receiver already stopped");
            }
        }
    }
}
