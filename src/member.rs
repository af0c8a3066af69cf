//! A single swarm member: neighbor bookkeeping, separation corrections and
//! thrust blending.
//!
//! Members never own each other. Neighbor slots hold [`MemberId`] handles that
//! the coordinator resolves on demand; a handle whose member has been removed
//! simply stops resolving and is treated as infinitely far away.

use std::fmt;

use glam::Vec3;
use tracing::{trace, warn};

use crate::body::PhysicalBody;
use crate::config::{validate_separation, MemberConfig, NeighborPolicy};
use crate::error::{SwarmError, SwarmResult};
use crate::math::{self, MathMode};

pub const NEIGHBOR_SLOTS: usize = 2;

/// Generation-checked handle into the coordinator's member arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId {
    index: u32,
    generation: u32,
}

impl MemberId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NeighborLink {
    pub id: MemberId,
    /// Distance measured when the link was last considered or refreshed.
    pub distance: f32,
}

/// What one planning pass produced for a member.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlanOutcome {
    /// Slots that had no resolvable neighbor and contributed a zero correction.
    pub missing: usize,
    pub links: usize,
    /// Sum of `|distance - ideal_separation|` over resolved links.
    pub separation_error: f32,
}

#[derive(Clone, Debug)]
pub struct Member {
    id: MemberId,
    ideal_separation: f32,
    separation_threshold: f32,
    force_scale: f32,
    math_mode: MathMode,
    policy: NeighborPolicy,
    neighbors: [Option<NeighborLink>; NEIGHBOR_SLOTS],
    local_thrust: [Vec3; NEIGHBOR_SLOTS],
    global_thrust: Vec3,
    thrust: Vec3,
}

impl Member {
    pub fn new(id: MemberId, config: &MemberConfig) -> SwarmResult<Self> {
        config.validate()?;

        Ok(Self {
            id,
            ideal_separation: config.ideal_separation,
            separation_threshold: config.separation_threshold,
            force_scale: config.force_scale,
            math_mode: config.math_mode,
            policy: config.neighbor_policy,
            neighbors: [None; NEIGHBOR_SLOTS],
            local_thrust: [Vec3::ZERO; NEIGHBOR_SLOTS],
            global_thrust: Vec3::ZERO,
            thrust: Vec3::new(0.0, config.gravity_bias, 0.0),
        })
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn ideal_separation(&self) -> f32 {
        self.ideal_separation
    }

    pub fn separation_threshold(&self) -> f32 {
        self.separation_threshold
    }

    pub fn policy(&self) -> NeighborPolicy {
        self.policy
    }

    pub fn neighbor(&self, slot: usize) -> Option<MemberId> {
        self.neighbors.get(slot).copied().flatten().map(|link| link.id)
    }

    /// Cached distance for `slot`; an empty slot reads as infinitely far.
    pub fn neighbor_distance(&self, slot: usize) -> f32 {
        self.neighbors
            .get(slot)
            .copied()
            .flatten()
            .map_or(f32::INFINITY, |link| link.distance)
    }

    pub fn neighbors(&self) -> &[Option<NeighborLink>; NEIGHBOR_SLOTS] {
        &self.neighbors
    }

    pub fn local_thrust(&self, slot: usize) -> Vec3 {
        self.local_thrust.get(slot).copied().unwrap_or(Vec3::ZERO)
    }

    pub fn global_thrust(&self) -> Vec3 {
        self.global_thrust
    }

    pub fn thrust(&self) -> Vec3 {
        self.thrust
    }

    /// Replace the target neighbor distance. Takes effect on the next correction.
    pub fn update_ideal_separation(&mut self, value: f32) -> SwarmResult<()> {
        validate_separation(value, self.separation_threshold)?;
        self.ideal_separation = value;
        Ok(())
    }

    pub fn receive_global_thrust(&mut self, vector: Vec3) {
        if !vector.is_finite() {
            warn!(member = %self.id, "ignoring non-finite global thrust");
            return;
        }
        self.global_thrust = vector;
    }

    /// Offer `candidate` as a neighbor. Returns the slot it now occupies, if any.
    ///
    /// Re-offering a current neighbor only refreshes its cached distance, so
    /// repeated sweeps over unchanged positions never move links around.
    pub fn consider_neighbor(
        &mut self,
        own_position: Vec3,
        candidate: MemberId,
        candidate_position: Vec3,
    ) -> Option<usize> {
        if candidate == self.id {
            return None;
        }

        let distance = own_position.distance(candidate_position);
        if !distance.is_finite() {
            return None;
        }

        if let Some(slot) = self.slot_of(candidate) {
            if let Some(link) = self.neighbors[slot].as_mut() {
                link.distance = distance;
            }
            if self.policy == NeighborPolicy::Nearest {
                self.sort_nearest();
            }
            return self.slot_of(candidate);
        }

        let link = NeighborLink {
            id: candidate,
            distance,
        };

        // An empty anchor slot is filled unconditionally, whatever the policy.
        if self.neighbors[0].is_none() {
            self.neighbors[0] = Some(link);
            return Some(0);
        }

        match self.policy {
            NeighborPolicy::Nearest => {
                if distance < self.neighbor_distance(0) {
                    self.neighbors[1] = self.neighbors[0];
                    self.neighbors[0] = Some(link);
                    Some(0)
                } else if distance < self.neighbor_distance(1) {
                    self.neighbors[1] = Some(link);
                    Some(1)
                } else {
                    None
                }
            }
            NeighborPolicy::Anchor => {
                if distance < self.neighbor_distance(0) || self.neighbors[1].is_none() {
                    self.neighbors[1] = Some(link);
                    Some(1)
                } else {
                    None
                }
            }
        }
    }

    /// Re-measure cached distances at the start of a discovery pass.
    ///
    /// Links that no longer resolve are dropped, and a surviving slot-1 link is
    /// promoted so slot 0 is never empty while slot 1 is set. Returns the number
    /// of dropped links.
    pub fn refresh_neighbors<F>(&mut self, own_position: Vec3, lookup: F) -> usize
    where
        F: Fn(MemberId) -> Option<Vec3>,
    {
        let mut dropped = 0;
        for slot in 0..NEIGHBOR_SLOTS {
            let Some(link) = self.neighbors[slot] else {
                continue;
            };
            match lookup(link.id).filter(|_| link.id != self.id) {
                Some(position) => {
                    let distance = own_position.distance(position);
                    self.neighbors[slot] = Some(NeighborLink {
                        id: link.id,
                        distance: if distance.is_finite() {
                            distance
                        } else {
                            f32::INFINITY
                        },
                    });
                }
                None => {
                    trace!(member = %self.id, neighbor = %link.id, slot, "dropping stale neighbor");
                    self.neighbors[slot] = None;
                    dropped += 1;
                }
            }
        }

        if self.neighbors[0].is_none() {
            self.neighbors[0] = self.neighbors[1].take();
        }
        if self.policy == NeighborPolicy::Nearest {
            self.sort_nearest();
        }
        dropped
    }

    /// Correction for one slot, resolved through `lookup`.
    ///
    /// Fails with [`SwarmError::NoNeighbor`] when the slot is empty or its
    /// member is gone; callers treat that as a zero correction.
    pub fn correction_vector<F>(
        &self,
        slot: usize,
        own_position: Vec3,
        lookup: F,
    ) -> SwarmResult<Vec3>
    where
        F: Fn(MemberId) -> Option<Vec3>,
    {
        let (neighbor, position) = self
            .neighbor(slot)
            .and_then(|id| lookup(id).map(|position| (id, position)))
            .ok_or(SwarmError::NoNeighbor { slot })?;

        Ok(separation_correction(
            self.math_mode,
            own_position,
            position,
            self.ideal_separation,
            self.separation_threshold,
            self.coincident_axis(neighbor),
        ))
    }

    /// Planning phase: recompute both local corrections from current positions.
    pub fn plan<F>(&mut self, own_position: Vec3, lookup: F) -> PlanOutcome
    where
        F: Fn(MemberId) -> Option<Vec3>,
    {
        let mut outcome = PlanOutcome::default();

        for slot in 0..NEIGHBOR_SLOTS {
            match self.correction_vector(slot, own_position, &lookup) {
                Ok(correction) => {
                    self.local_thrust[slot] = correction;
                    outcome.links += 1;
                    if let Some(position) = self.neighbor(slot).and_then(&lookup) {
                        outcome.separation_error +=
                            (own_position.distance(position) - self.ideal_separation).abs();
                    }
                }
                Err(_) => {
                    self.local_thrust[slot] = Vec3::ZERO;
                    outcome.missing += 1;
                }
            }
        }

        outcome
    }

    /// Planning for a member whose own position is unknown: both corrections
    /// are zeroed and both slots count as missing.
    pub fn plan_without_position(&mut self) -> PlanOutcome {
        self.local_thrust = [Vec3::ZERO; NEIGHBOR_SLOTS];
        PlanOutcome {
            missing: NEIGHBOR_SLOTS,
            ..PlanOutcome::default()
        }
    }

    /// Fold local0, local1 and the global vector into the persistent thrust,
    /// in that order, re-normalizing after each step.
    pub fn blend_thrust(&mut self) -> Vec3 {
        let mut thrust = self.thrust;
        for local in self.local_thrust {
            thrust = math::fold_normalized(self.math_mode, thrust, local);
        }
        thrust = math::fold_normalized(self.math_mode, thrust, self.global_thrust);
        self.thrust = thrust;
        thrust
    }

    /// Actuation phase: blend, then hand the scaled thrust to the body.
    pub fn actuate<B: PhysicalBody + ?Sized>(&mut self, body: &mut B) -> Vec3 {
        let force = self.blend_thrust() * self.force_scale;
        body.apply_force(force);
        force
    }

    fn slot_of(&self, candidate: MemberId) -> Option<usize> {
        self.neighbors
            .iter()
            .position(|link| matches!(link, Some(link) if link.id == candidate))
    }

    fn sort_nearest(&mut self) {
        if self.neighbor_distance(1) < self.neighbor_distance(0) {
            self.neighbors.swap(0, 1);
        }
    }

    // Two members on the same spot still need opposite escape directions.
    fn coincident_axis(&self, neighbor: MemberId) -> Vec3 {
        if self.id < neighbor {
            Vec3::X
        } else {
            Vec3::NEG_X
        }
    }
}

/// Unit correction away from `neighbor` when closer than `ideal - threshold`,
/// toward it when farther than `ideal + threshold`, and exactly zero inside the
/// inclusive band.
///
/// `coincident_axis` is the assumed direction to the neighbor when both sit on
/// the same point.
pub fn separation_correction(
    mode: MathMode,
    own_position: Vec3,
    neighbor: Vec3,
    ideal: f32,
    threshold: f32,
    coincident_axis: Vec3,
) -> Vec3 {
    let offset = neighbor - own_position;
    let distance = offset.length();
    if !distance.is_finite() {
        return Vec3::ZERO;
    }

    if distance < ideal - threshold {
        -math::normalize_or(mode, offset, coincident_axis)
    } else if distance > ideal + threshold {
        math::normalize_or(mode, offset, coincident_axis)
    } else {
        Vec3::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::{separation_correction, Member, MemberId, NEIGHBOR_SLOTS};
    use crate::body::PointMass;
    use crate::config::{MemberConfig, NeighborPolicy};
    use crate::error::SwarmError;
    use crate::math::MathMode;
    use glam::Vec3;
    use std::collections::HashMap;

    fn id(index: u32) -> MemberId {
        MemberId::new(index, 0)
    }

    fn member(policy: NeighborPolicy) -> Member {
        let config = MemberConfig {
            neighbor_policy: policy,
            ..MemberConfig::default()
        };
        Member::new(id(0), &config).unwrap()
    }

    fn correction(distance: f32, ideal: f32, threshold: f32) -> Vec3 {
        separation_correction(
            MathMode::Accurate,
            Vec3::ZERO,
            Vec3::new(distance, 0.0, 0.0),
            ideal,
            threshold,
            Vec3::X,
        )
    }

    #[test]
    fn rejects_invalid_construction() {
        let config = MemberConfig {
            ideal_separation: 0.0,
            ..MemberConfig::default()
        };
        assert!(matches!(
            Member::new(id(0), &config),
            Err(SwarmError::InvalidIdealSeparation(_))
        ));

        let config = MemberConfig {
            separation_threshold: -1.0,
            ..MemberConfig::default()
        };
        assert!(matches!(
            Member::new(id(0), &config),
            Err(SwarmError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn too_close_points_away() {
        for distance in [0.5, 10.0, 50.0, 80.0, 94.9] {
            let v = correction(distance, 100.0, 5.0);
            assert!(v.x < 0.0, "distance {distance} gave {v:?}");
            assert!((v.length() - 1.0).abs() < 1.0e-5);
        }
    }

    #[test]
    fn too_far_points_toward() {
        for distance in [105.1, 120.0, 400.0, 1.0e5] {
            let v = correction(distance, 100.0, 5.0);
            assert!(v.x > 0.0, "distance {distance} gave {v:?}");
        }
    }

    #[test]
    fn band_is_zero_inclusive() {
        for (ideal, threshold) in [(100.0, 5.0), (150.0, 0.0), (10.0, 9.5), (1.0, 0.25)] {
            for distance in [ideal - threshold, ideal, ideal + threshold] {
                assert_eq!(correction(distance, ideal, threshold), Vec3::ZERO);
            }
        }
    }

    #[test]
    fn reference_scenario() {
        assert!(correction(80.0, 100.0, 5.0).x < 0.0);
        assert_eq!(correction(100.0, 100.0, 5.0), Vec3::ZERO);
        assert!(correction(120.0, 100.0, 5.0).x > 0.0);
    }

    #[test]
    fn coincident_members_escape_in_opposite_directions() {
        let mut a = Member::new(id(1), &MemberConfig::default()).unwrap();
        let mut b = Member::new(id(2), &MemberConfig::default()).unwrap();
        let positions: HashMap<MemberId, Vec3> =
            [(id(1), Vec3::ZERO), (id(2), Vec3::ZERO)].into_iter().collect();
        let lookup = |other: MemberId| positions.get(&other).copied();

        a.consider_neighbor(Vec3::ZERO, id(2), Vec3::ZERO);
        b.consider_neighbor(Vec3::ZERO, id(1), Vec3::ZERO);

        let va = a.correction_vector(0, Vec3::ZERO, lookup).unwrap();
        let vb = b.correction_vector(0, Vec3::ZERO, lookup).unwrap();
        assert_eq!(va, -vb);
        assert!(va.length() > 0.0);
    }

    #[test]
    fn empty_slot_zero_takes_any_candidate() {
        for policy in [NeighborPolicy::Nearest, NeighborPolicy::Anchor] {
            let mut m = member(policy);
            assert_eq!(
                m.consider_neighbor(Vec3::ZERO, id(7), Vec3::new(1.0e6, 0.0, 0.0)),
                Some(0)
            );
            assert_eq!(m.neighbor(0), Some(id(7)));
            assert_eq!(m.neighbor_distance(0), 1.0e6);
        }
    }

    #[test]
    fn ignores_self() {
        let mut m = member(NeighborPolicy::Nearest);
        assert_eq!(m.consider_neighbor(Vec3::ZERO, id(0), Vec3::X), None);
        assert_eq!(m.neighbor(0), None);
    }

    #[test]
    fn repeated_consideration_does_not_thrash() {
        for policy in [NeighborPolicy::Nearest, NeighborPolicy::Anchor] {
            let mut m = member(policy);
            let candidates = [
                (id(1), Vec3::new(30.0, 0.0, 0.0)),
                (id(2), Vec3::new(10.0, 0.0, 0.0)),
                (id(3), Vec3::new(20.0, 0.0, 0.0)),
            ];

            for (candidate, position) in candidates {
                m.consider_neighbor(Vec3::ZERO, candidate, position);
            }
            let first = *m.neighbors();

            for _ in 0..5 {
                for (candidate, position) in candidates {
                    m.consider_neighbor(Vec3::ZERO, candidate, position);
                }
                assert_eq!(*m.neighbors(), first, "{policy:?}");
            }

            let (candidate, position) = candidates[1];
            let slot = m.consider_neighbor(Vec3::ZERO, candidate, position);
            assert_eq!(slot.and_then(|s| m.neighbor(s)), Some(candidate));
        }
    }

    #[test]
    fn nearest_policy_keeps_two_closest() {
        let mut m = member(NeighborPolicy::Nearest);
        m.consider_neighbor(Vec3::ZERO, id(1), Vec3::new(30.0, 0.0, 0.0));
        m.consider_neighbor(Vec3::ZERO, id(2), Vec3::new(0.0, 10.0, 0.0));
        m.consider_neighbor(Vec3::ZERO, id(3), Vec3::new(0.0, 0.0, 20.0));
        m.consider_neighbor(Vec3::ZERO, id(4), Vec3::new(50.0, 0.0, 0.0));

        assert_eq!(m.neighbor(0), Some(id(2)));
        assert_eq!(m.neighbor(1), Some(id(3)));
        assert_eq!(m.neighbor_distance(0), 10.0);
        assert_eq!(m.neighbor_distance(1), 20.0);
    }

    #[test]
    fn anchor_policy_never_replaces_slot_zero() {
        let mut m = member(NeighborPolicy::Anchor);
        m.consider_neighbor(Vec3::ZERO, id(1), Vec3::new(30.0, 0.0, 0.0));
        m.consider_neighbor(Vec3::ZERO, id(2), Vec3::new(10.0, 0.0, 0.0));
        m.consider_neighbor(Vec3::ZERO, id(3), Vec3::new(20.0, 0.0, 0.0));
        m.consider_neighbor(Vec3::ZERO, id(4), Vec3::new(50.0, 0.0, 0.0));

        // The closest candidate does not displace the anchor; the last candidate
        // that beat the anchor holds slot 1.
        assert_eq!(m.neighbor(0), Some(id(1)));
        assert_eq!(m.neighbor(1), Some(id(3)));
    }

    #[test]
    fn anchor_policy_fills_empty_second_slot() {
        let mut m = member(NeighborPolicy::Anchor);
        m.consider_neighbor(Vec3::ZERO, id(1), Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(
            m.consider_neighbor(Vec3::ZERO, id(2), Vec3::new(90.0, 0.0, 0.0)),
            Some(1)
        );
        assert_eq!(
            m.consider_neighbor(Vec3::ZERO, id(3), Vec3::new(80.0, 0.0, 0.0)),
            None
        );
    }

    #[test]
    fn refresh_drops_dead_links_and_promotes() {
        for policy in [NeighborPolicy::Nearest, NeighborPolicy::Anchor] {
            let mut m = member(policy);
            m.consider_neighbor(Vec3::ZERO, id(1), Vec3::new(10.0, 0.0, 0.0));
            m.consider_neighbor(Vec3::ZERO, id(2), Vec3::new(20.0, 0.0, 0.0));
            assert_eq!(m.neighbor(0), Some(id(1)));

            let dropped = m.refresh_neighbors(Vec3::ZERO, |other| {
                (other == id(2)).then_some(Vec3::new(0.0, 25.0, 0.0))
            });
            assert_eq!(dropped, 1);
            assert_eq!(m.neighbor(0), Some(id(2)));
            assert_eq!(m.neighbor_distance(0), 25.0);
            assert_eq!(m.neighbor(1), None);
            assert_eq!(m.neighbor_distance(1), f32::INFINITY);
        }
    }

    #[test]
    fn missing_neighbors_plan_to_zero() {
        let mut m = member(NeighborPolicy::Nearest);
        let outcome = m.plan(Vec3::ZERO, |_| None);
        assert_eq!(outcome.missing, NEIGHBOR_SLOTS);
        assert_eq!(outcome.links, 0);
        assert_eq!(m.local_thrust(0), Vec3::ZERO);
        assert_eq!(m.local_thrust(1), Vec3::ZERO);

        assert!(matches!(
            m.correction_vector(1, Vec3::ZERO, |_| None),
            Err(SwarmError::NoNeighbor { slot: 1 })
        ));
    }

    #[test]
    fn unknown_own_position_clears_previous_corrections() {
        let mut m = member(NeighborPolicy::Nearest);
        m.local_thrust = [Vec3::X, Vec3::Z];

        let outcome = m.plan_without_position();
        assert_eq!(outcome.missing, NEIGHBOR_SLOTS);
        assert_eq!(outcome.links, 0);
        assert_eq!(m.local_thrust(0), Vec3::ZERO);
        assert_eq!(m.local_thrust(1), Vec3::ZERO);
    }

    #[test]
    fn stale_neighbor_plans_to_zero() {
        let mut m = member(NeighborPolicy::Nearest);
        m.consider_neighbor(Vec3::ZERO, id(1), Vec3::new(50.0, 0.0, 0.0));
        let outcome = m.plan(Vec3::ZERO, |_| None);
        assert_eq!(outcome.missing, 2);
        assert_eq!(m.local_thrust(0), Vec3::ZERO);
    }

    #[test]
    fn separation_update_is_immediate() {
        let mut m = member(NeighborPolicy::Nearest);
        let neighbor = Vec3::new(120.0, 0.0, 0.0);
        m.consider_neighbor(Vec3::ZERO, id(1), neighbor);
        let lookup = |_: MemberId| Some(neighbor);

        assert!(m.correction_vector(0, Vec3::ZERO, lookup).unwrap().x > 0.0);
        m.update_ideal_separation(150.0).unwrap();
        assert_eq!(m.ideal_separation(), 150.0);
        assert!(m.correction_vector(0, Vec3::ZERO, lookup).unwrap().x < 0.0);
    }

    #[test]
    fn separation_update_is_validated() {
        let mut m = member(NeighborPolicy::Nearest);
        assert!(m.update_ideal_separation(-5.0).is_err());
        assert!(m.update_ideal_separation(5.0).is_err());
        assert_eq!(m.ideal_separation(), 100.0);
    }

    #[test]
    fn thrust_is_seeded_with_gravity_bias() {
        let m = member(NeighborPolicy::Nearest);
        assert_eq!(m.thrust(), Vec3::new(0.0, 9.8, 0.0));
    }

    #[test]
    fn blending_nothing_only_normalizes() {
        let mut m = member(NeighborPolicy::Nearest);
        let before = m.thrust().normalize();
        let after = m.blend_thrust();
        assert!((after - before).length() < 1.0e-6);
        assert!((m.blend_thrust() - before).length() < 1.0e-6);
    }

    #[test]
    fn fold_order_is_local_then_global() {
        let mut m = member(NeighborPolicy::Nearest);
        m.local_thrust = [Vec3::X, Vec3::Z];
        m.receive_global_thrust(Vec3::NEG_Y);

        let expected = {
            let mut t = Vec3::new(0.0, 9.8, 0.0);
            t = (t + Vec3::X).normalize();
            t = (t + Vec3::Z).normalize();
            (t + Vec3::NEG_Y).normalize()
        };
        assert!((m.blend_thrust() - expected).length() < 1.0e-6);
    }

    #[test]
    fn non_finite_global_thrust_is_ignored() {
        let mut m = member(NeighborPolicy::Nearest);
        m.receive_global_thrust(Vec3::X);
        m.receive_global_thrust(Vec3::new(f32::NAN, 0.0, 0.0));
        assert_eq!(m.global_thrust(), Vec3::X);
    }

    #[test]
    fn actuate_scales_and_applies_force() {
        let config = MemberConfig {
            force_scale: 20.0,
            ..MemberConfig::default()
        };
        let mut m = Member::new(id(0), &config).unwrap();
        let mut body = PointMass::new(Vec3::ZERO);

        let force = m.actuate(&mut body);
        assert!((force - Vec3::new(0.0, 20.0, 0.0)).length() < 1.0e-5);
        assert_eq!(body.pending_force(), force);
    }
}
