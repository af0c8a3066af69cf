//! Coupling to the physics substrate.
//!
//! The swarm core only ever reads a position and hands back a force. Mass,
//! drag and collisions belong to whatever implements [`PhysicalBody`].

use glam::Vec3;

use crate::math::EPSILON;

pub const DEFAULT_MASS: f32 = 1.0;
pub const DEFAULT_DRAG: f32 = 0.5;
pub const DEFAULT_GRAVITY: f32 = 9.8;

pub trait PhysicalBody {
    fn position(&self) -> Vec3;

    /// Queue a force for the substrate's next integration step.
    fn apply_force(&mut self, force: Vec3);
}

/// Small point-mass body, enough to drive the swarm without a physics engine.
#[derive(Clone, Debug, PartialEq)]
pub struct PointMass {
    pub position: Vec3,
    pub velocity: Vec3,
    pub mass: f32,
    pub drag: f32,
    pub gravity: f32,
    accumulated_force: Vec3,
}

impl PointMass {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            mass: DEFAULT_MASS,
            drag: DEFAULT_DRAG,
            gravity: DEFAULT_GRAVITY,
            accumulated_force: Vec3::ZERO,
        }
    }

    pub fn with_gravity(mut self, gravity: f32) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn pending_force(&self) -> Vec3 {
        self.accumulated_force
    }

    /// Semi-implicit Euler step. Consumes the forces queued since the last call.
    pub fn integrate(&mut self, dt: f32) {
        if dt <= 0.0 || !dt.is_finite() {
            return;
        }

        let drag_damping = if self.drag <= EPSILON {
            1.0
        } else {
            (-self.drag * dt).exp()
        };

        let accel = self.accumulated_force / self.mass.max(EPSILON) - Vec3::Y * self.gravity;
        self.velocity = (self.velocity + accel * dt) * drag_damping;
        self.position += self.velocity * dt;
        self.accumulated_force = Vec3::ZERO;
    }
}

impl PhysicalBody for PointMass {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn apply_force(&mut self, force: Vec3) {
        self.accumulated_force += force;
    }
}
