use glam::Vec3;
use tracing::warn;
use wasm_bindgen::prelude::*;

pub mod body;
pub mod config;
pub mod error;
pub mod math;
pub mod member;
pub mod neighbor_grid;
pub mod swarm;

pub use body::{PhysicalBody, PointMass};
pub use config::{Discovery, MemberConfig, NeighborPolicy, SwarmConfig};
pub use error::{SwarmError, SwarmResult};
pub use member::{Member, MemberId, PlanOutcome};
pub use swarm::{Swarm, TickReport};

use config::{clamp_finite, DEFAULT_GRID_RADIUS_FACTOR};

// Enough to hold a point mass of 1 against gravity with some margin.
const SIM_FORCE_SCALE: f32 = 12.0;
const MAX_DT: f32 = 0.1;
const FALLBACK_SEED: u32 = 0x9e37_79b9;

/// Browser-facing driver: a swarm of point masses stepped on a fixed clock.
#[wasm_bindgen]
pub struct Sim {
    swarm: Swarm<PointMass>,
    // Render order. Removal swaps the last member into the hole.
    order: Vec<MemberId>,
    render_positions: Vec<f32>,
    last_report: TickReport,
}

#[wasm_bindgen]
impl Sim {
    #[wasm_bindgen(constructor)]
    pub fn new(count: usize, seed: u32, width: f32, depth: f32) -> Result<Sim, JsError> {
        let config = SwarmConfig {
            member: MemberConfig {
                force_scale: SIM_FORCE_SCALE,
                ..MemberConfig::default()
            },
            discovery: Discovery::Grid {
                radius_factor: DEFAULT_GRID_RADIUS_FACTOR,
            },
            ..SwarmConfig::default()
        };
        Ok(Self::with_config(config, count, seed, width, depth)?)
    }

    pub fn from_config_json(
        json: &str,
        count: usize,
        seed: u32,
        width: f32,
        depth: f32,
    ) -> Result<Sim, JsError> {
        let config = SwarmConfig::from_json(json)?;
        Ok(Self::with_config(config, count, seed, width, depth)?)
    }

    pub fn step(&mut self, dt: f32) {
        let dt = clamp_finite(dt, 0.0, MAX_DT, 0.0);
        self.last_report = self.swarm.step();
        for body in self.swarm.bodies_mut() {
            body.integrate(dt);
        }
        self.sync_render_buffers();
    }

    pub fn count(&self) -> usize {
        self.swarm.len()
    }

    /// Adds a member at the given point and returns its render index.
    pub fn add_member(&mut self, x: f32, y: f32, z: f32) -> Result<usize, JsError> {
        let id = self.swarm.spawn(PointMass::new(Vec3::new(x, y, z)))?;
        self.order.push(id);
        self.sync_render_buffers();
        Ok(self.order.len() - 1)
    }

    pub fn remove_member(&mut self, index: usize) -> bool {
        if index >= self.order.len() {
            return false;
        }
        let id = self.order.swap_remove(index);
        let removed = match self.swarm.remove(id) {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, member = %id, "remove failed");
                false
            }
        };
        self.sync_render_buffers();
        removed
    }

    /// A non-positive or non-finite area pins the separation instead.
    pub fn set_lift_area(&mut self, area: f32) -> Result<(), JsError> {
        let area = (area.is_finite() && area > 0.0).then_some(area);
        Ok(self.swarm.set_lift_area(area)?)
    }

    pub fn set_ideal_separation(&mut self, value: f32) -> Result<(), JsError> {
        Ok(self.swarm.set_ideal_separation(value)?)
    }

    pub fn set_global_thrust(&mut self, x: f32, y: f32, z: f32) -> Result<(), JsError> {
        Ok(self.swarm.broadcast_global_thrust(Vec3::new(x, y, z))?)
    }

    pub fn ideal_separation(&self) -> f32 {
        self.swarm.ideal_separation()
    }

    /// Flat `x, y, z` triples in render order.
    pub fn positions(&self) -> Vec<f32> {
        self.render_positions.clone()
    }

    pub fn last_mean_error(&self) -> f32 {
        self.last_report.mean_separation_error
    }

    pub fn last_missing_neighbors(&self) -> usize {
        self.last_report.missing_neighbors
    }
}

impl Sim {
    /// Scatter `count` members over a jittered grid in the `width` x `depth`
    /// ground plane. `seed == 0` draws a seed from the platform.
    pub fn with_config(
        config: SwarmConfig,
        count: usize,
        seed: u32,
        width: f32,
        depth: f32,
    ) -> SwarmResult<Sim> {
        let mut swarm = Swarm::new(config)?;
        let seed = if seed == 0 { random_seed() } else { seed };
        let width = clamp_finite(width, 0.0, f32::MAX, 0.0);
        let depth = clamp_finite(depth, 0.0, f32::MAX, 0.0);

        let cols = (count as f32).sqrt().ceil().max(1.0) as usize;
        let rows = count.div_ceil(cols).max(1);
        let cell_x = width / cols as f32;
        let cell_z = depth / rows as f32;

        let mut order = Vec::with_capacity(count);
        for i in 0..count {
            let (col, row) = (i % cols, i / cols);
            let jitter_x = hash_unit(seed, i as u32, 0) * 0.25 * cell_x;
            let jitter_z = hash_unit(seed, i as u32, 2) * 0.25 * cell_z;
            let position = Vec3::new(
                (col as f32 + 0.5) * cell_x - 0.5 * width + jitter_x,
                0.0,
                (row as f32 + 0.5) * cell_z - 0.5 * depth + jitter_z,
            );
            order.push(swarm.spawn(PointMass::new(position))?);
        }

        let mut sim = Sim {
            swarm,
            order,
            render_positions: Vec::new(),
            last_report: TickReport::default(),
        };
        sim.sync_render_buffers();
        Ok(sim)
    }

    pub fn swarm(&self) -> &Swarm<PointMass> {
        &self.swarm
    }

    pub fn last_report(&self) -> TickReport {
        self.last_report
    }

    fn sync_render_buffers(&mut self) {
        self.render_positions.clear();
        for &id in &self.order {
            let position = self.swarm.body(id).map_or(Vec3::ZERO, |body| body.position);
            self.render_positions
                .extend_from_slice(&[position.x, position.y, position.z]);
        }
    }
}

fn random_seed() -> u32 {
    let mut bytes = [0u8; 4];
    match getrandom::fill(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes).max(1),
        Err(err) => {
            warn!(%err, "platform randomness unavailable, using fixed seed");
            FALLBACK_SEED
        }
    }
}

/// Deterministic value in `[-1, 1]` for `(seed, index, axis)`.
pub(crate) fn hash_unit(seed: u32, index: u32, axis: u32) -> f32 {
    let mut h = seed ^ index.wrapping_mul(0x85eb_ca6b) ^ axis.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h = h.wrapping_mul(0x7feb_352d);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846c_a68b);
    h ^= h >> 16;
    (h as f32 / u32::MAX as f32) * 2.0 - 1.0
}
