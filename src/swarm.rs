//! The coordinator: owns every member and its body, tracks population size,
//! adapts the ideal separation, runs neighbor discovery and drives the
//! two-phase tick.
//!
//! A tick is strictly ordered:
//! 1. discovery (neighbor slots only),
//! 2. global thrust broadcast,
//! 3. planning (local corrections, reading a frozen position snapshot),
//! 4. actuation (thrust blending and force application).
//!
//! Planning never sees a force queued by actuation in the same tick, and the
//! broadcast always lands before any member actuates.

use glam::Vec3;
use tracing::{debug, trace, warn};

use crate::body::PhysicalBody;
use crate::config::{validate_separation, Discovery, SwarmConfig};
use crate::error::{SwarmError, SwarmResult};
use crate::math;
use crate::member::{Member, MemberId, NEIGHBOR_SLOTS};
use crate::neighbor_grid::NeighborGrid;

/// Per-tick summary of what the swarm did.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub members: usize,
    /// Neighbor slots that resolved to a live member during planning.
    pub links: usize,
    /// Neighbor slots that planned a zero correction for lack of a neighbor.
    pub missing_neighbors: usize,
    /// Links to removed members cleared at the start of discovery.
    pub stale_links_dropped: usize,
    /// Mean `|distance - ideal_separation|` over resolved links.
    pub mean_separation_error: f32,
}

struct Occupant<B> {
    member: Member,
    body: B,
}

struct Slot<B> {
    generation: u32,
    occupant: Option<Occupant<B>>,
}

pub struct Swarm<B> {
    config: SwarmConfig,
    slots: Vec<Slot<B>>,
    free: Vec<u32>,
    live: usize,
    ideal_separation: f32,
    global_thrust: Vec3,
    tick: u64,
    grid: NeighborGrid,
    // Indexed by arena slot: generation and position at the last snapshot.
    snapshot: Vec<Option<(u32, Vec3)>>,
    // Live members packed densely for the grid.
    dense_ids: Vec<MemberId>,
    dense_positions: Vec<Vec3>,
}

impl<B: PhysicalBody> Swarm<B> {
    pub fn new(config: SwarmConfig) -> SwarmResult<Self> {
        config.validate()?;
        let ideal_separation = config.member.ideal_separation;

        Ok(Self {
            config,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            ideal_separation,
            global_thrust: Vec3::ZERO,
            tick: 0,
            grid: NeighborGrid::new(ideal_separation),
            snapshot: Vec::new(),
            dense_ids: Vec::new(),
            dense_positions: Vec::new(),
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn ideal_separation(&self) -> f32 {
        self.ideal_separation
    }

    pub fn global_thrust(&self) -> Vec3 {
        self.global_thrust
    }

    /// Add a member driving `body`. The population change re-derives the ideal
    /// separation for everyone.
    pub fn spawn(&mut self, body: B) -> SwarmResult<MemberId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    SwarmError::InvalidConfig("member arena is full".to_string())
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    occupant: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = MemberId::new(index, slot.generation);
        let mut member_config = self.config.member;
        member_config.ideal_separation = self.ideal_separation;

        let mut member = match Member::new(id, &member_config) {
            Ok(member) => member,
            Err(err) => {
                self.free.push(index);
                return Err(err);
            }
        };
        member.receive_global_thrust(self.global_thrust);
        slot.occupant = Some(Occupant { member, body });
        self.live += 1;

        debug!(member = %id, population = self.live, "member joined");
        self.adapt_separation()?;
        Ok(id)
    }

    /// Remove a member and hand back its body. Links other members hold to it
    /// go stale and are replaced on the next discovery pass.
    pub fn remove(&mut self, id: MemberId) -> SwarmResult<B> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .ok_or(SwarmError::UnknownMember(id))?;
        let occupant = slot.occupant.take().ok_or(SwarmError::UnknownMember(id))?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.live -= 1;

        debug!(member = %id, population = self.live, "member left");
        self.adapt_separation()?;
        Ok(occupant.body)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.occupant(id).is_some()
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.occupant(id).map(|occupant| &occupant.member)
    }

    pub fn body(&self, id: MemberId) -> Option<&B> {
        self.occupant(id).map(|occupant| &occupant.body)
    }

    pub fn body_mut(&mut self, id: MemberId) -> Option<&mut B> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.occupant.as_mut())
            .map(|occupant| &mut occupant.body)
    }

    pub fn ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.iter().map(|(member, _)| member.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Member, &B)> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.occupant.as_ref())
            .map(|occupant| (&occupant.member, &occupant.body))
    }

    pub fn bodies_mut(&mut self) -> impl Iterator<Item = &mut B> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.occupant.as_mut())
            .map(|occupant| &mut occupant.body)
    }

    /// Push an explicit ideal separation to every member.
    ///
    /// Without a lift area the value sticks for future members too; with one it
    /// holds until the next population change re-derives it.
    pub fn set_ideal_separation(&mut self, value: f32) -> SwarmResult<()> {
        validate_separation(value, self.config.member.separation_threshold)?;
        if self.config.lift_area.is_none() {
            self.config.member.ideal_separation = value;
        }
        self.push_separation(value)
    }

    fn push_separation(&mut self, value: f32) -> SwarmResult<()> {
        self.ideal_separation = value;
        for occupant in self.occupants_mut() {
            occupant.member.update_ideal_separation(value)?;
        }
        debug!(ideal_separation = value, "ideal separation updated");
        Ok(())
    }

    /// Change the area the lattice covers (`None` pins the configured separation)
    /// and re-derive the ideal separation right away.
    pub fn set_lift_area(&mut self, lift_area: Option<f32>) -> SwarmResult<()> {
        let mut config = self.config.clone();
        config.lift_area = lift_area;
        config.validate()?;
        self.config = config;
        self.adapt_separation()
    }

    pub fn set_lift_target(&mut self, target: Option<Vec3>) -> SwarmResult<()> {
        let mut config = self.config.clone();
        config.lift_target = target;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Deliver `vector` to every member. Members keep it until the next broadcast.
    pub fn broadcast_global_thrust(&mut self, vector: Vec3) -> SwarmResult<()> {
        if !vector.is_finite() {
            return Err(SwarmError::InvalidConfig(
                "global thrust must be finite".to_string(),
            ));
        }
        self.global_thrust = vector;
        for occupant in self.occupants_mut() {
            occupant.member.receive_global_thrust(vector);
        }
        Ok(())
    }

    /// Offer candidates to every member's neighbor slots. Returns the number of
    /// stale links dropped beforehand.
    pub fn discover_neighbors(&mut self) -> usize {
        self.take_snapshot();

        let snapshot = &self.snapshot;
        let lookup = |id: MemberId| resolve(snapshot, id);
        let mut dropped = 0;

        match self.config.discovery {
            Discovery::BruteForce => {
                for occupant in self.slots.iter_mut().filter_map(|slot| slot.occupant.as_mut()) {
                    let member = &mut occupant.member;
                    let Some(own) = lookup(member.id()) else {
                        continue;
                    };
                    dropped += member.refresh_neighbors(own, lookup);
                    consider_all(member, own, &self.dense_ids, &self.dense_positions);
                }
            }
            Discovery::Grid { radius_factor } => {
                let radius = self.ideal_separation * radius_factor;
                self.grid.set_cell_size(radius);
                self.grid.rebuild(&self.dense_positions);

                for (dense, &id) in self.dense_ids.iter().enumerate() {
                    let Some(occupant) = self.slots[id.index()].occupant.as_mut() else {
                        continue;
                    };
                    let member = &mut occupant.member;
                    let own = self.dense_positions[dense];
                    dropped += member.refresh_neighbors(own, lookup);

                    let mut offered = 0;
                    self.grid.for_each_neighbor(dense, radius, |other| {
                        member.consider_neighbor(
                            own,
                            self.dense_ids[other],
                            self.dense_positions[other],
                        );
                        offered += 1;
                    });
                    if offered < NEIGHBOR_SLOTS {
                        trace!(member = %id, offered, "grid too sparse, scanning all members");
                        consider_all(member, own, &self.dense_ids, &self.dense_positions);
                    }
                }
            }
        }

        dropped
    }

    /// Planning phase for every member against one frozen position snapshot.
    pub fn plan(&mut self) -> TickReport {
        self.take_snapshot();

        let snapshot = &self.snapshot;
        let lookup = |id: MemberId| resolve(snapshot, id);
        let mut report = TickReport {
            tick: self.tick,
            members: self.live,
            ..TickReport::default()
        };
        let mut error_sum = 0.0;

        for occupant in self.slots.iter_mut().filter_map(|slot| slot.occupant.as_mut()) {
            let member = &mut occupant.member;
            let outcome = match lookup(member.id()) {
                Some(own) => member.plan(own, lookup),
                None => {
                    trace!(member = %member.id(), "no usable position, corrections cleared");
                    member.plan_without_position()
                }
            };
            report.links += outcome.links;
            report.missing_neighbors += outcome.missing;
            error_sum += outcome.separation_error;
        }

        if report.links > 0 {
            report.mean_separation_error = error_sum / report.links as f32;
        }
        report
    }

    /// Actuation phase: every member blends its thrust and forces its body.
    pub fn actuate(&mut self) {
        for occupant in self.occupants_mut() {
            occupant.member.actuate(&mut occupant.body);
        }
    }

    /// One full tick: discovery, broadcast, planning, actuation.
    pub fn step(&mut self) -> TickReport {
        self.tick = self.tick.wrapping_add(1);

        let dropped = self.discover_neighbors();

        if let Some(target) = self.config.lift_target {
            let vector = self.lift_vector(target);
            if let Err(err) = self.broadcast_global_thrust(vector) {
                warn!(%err, "skipping lift broadcast");
            }
        }

        let mut report = self.plan();
        report.stale_links_dropped = dropped;
        self.actuate();

        debug!(
            tick = report.tick,
            members = report.members,
            links = report.links,
            missing = report.missing_neighbors,
            stale = report.stale_links_dropped,
            error = report.mean_separation_error,
            "swarm tick"
        );
        report
    }

    /// Unit vector from the swarm centroid toward `target`.
    pub fn lift_vector(&self, target: Vec3) -> Vec3 {
        let (sum, count) = self
            .iter()
            .map(|(_, body)| body.position())
            .filter(|position| position.is_finite())
            .fold((Vec3::ZERO, 0usize), |(sum, count), position| {
                (sum + position, count + 1)
            });
        if count == 0 {
            return Vec3::ZERO;
        }

        let centroid = sum / count as f32;
        math::normalize_or(self.config.member.math_mode, target - centroid, Vec3::ZERO)
    }

    fn adapt_separation(&mut self) -> SwarmResult<()> {
        let target = self.config.separation_for(self.live);
        if target == self.ideal_separation {
            return Ok(());
        }
        self.push_separation(target)
    }

    fn occupant(&self, id: MemberId) -> Option<&Occupant<B>> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.occupant.as_ref())
    }

    fn occupants_mut(&mut self) -> impl Iterator<Item = &mut Occupant<B>> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.occupant.as_mut())
    }

    fn take_snapshot(&mut self) {
        self.snapshot.clear();
        self.dense_ids.clear();
        self.dense_positions.clear();

        for slot in &self.slots {
            let Some(occupant) = slot.occupant.as_ref() else {
                self.snapshot.push(None);
                continue;
            };
            let position = occupant.body.position();
            if !position.is_finite() {
                warn!(member = %occupant.member.id(), "body reported a non-finite position");
                self.snapshot.push(None);
                continue;
            }
            self.snapshot.push(Some((slot.generation, position)));
            self.dense_ids.push(occupant.member.id());
            self.dense_positions.push(position);
        }
    }
}

fn resolve(snapshot: &[Option<(u32, Vec3)>], id: MemberId) -> Option<Vec3> {
    match snapshot.get(id.index()) {
        Some(Some((generation, position))) if *generation == id.generation() => Some(*position),
        _ => None,
    }
}

fn consider_all(member: &mut Member, own: Vec3, ids: &[MemberId], positions: &[Vec3]) {
    for (&id, &position) in ids.iter().zip(positions) {
        member.consider_neighbor(own, id, position);
    }
}
