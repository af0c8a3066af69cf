use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{SwarmError, SwarmResult};
use crate::math::MathMode;

pub const DEFAULT_IDEAL_SEPARATION: f32 = 100.0;
pub const DEFAULT_SEPARATION_THRESHOLD: f32 = 5.0;
pub const DEFAULT_GRAVITY_BIAS: f32 = 9.8;
pub const DEFAULT_FORCE_SCALE: f32 = 1.0;
pub const DEFAULT_GRID_RADIUS_FACTOR: f32 = 2.0;
pub const DEFAULT_MIN_SEPARATION: f32 = 10.0;
pub const DEFAULT_MAX_SEPARATION: f32 = 10_000.0;

/// How a member decides which of its two slots a newly discovered candidate takes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborPolicy {
    /// Slots always hold the two nearest live members.
    #[default]
    Nearest,
    /// Slot 0 is an anchor that is only replaced once its link dies; candidates
    /// closer than the anchor take slot 1.
    Anchor,
}

/// How the coordinator enumerates candidates during neighbor discovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Discovery {
    /// Every member considers every other member, in index order.
    #[default]
    BruteForce,
    /// Candidates come from a spatial grid within `radius_factor * ideal_separation`.
    Grid { radius_factor: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberConfig {
    pub ideal_separation: f32,
    pub separation_threshold: f32,
    /// Seeded once into the vertical thrust component.
    pub gravity_bias: f32,
    /// Multiplier turning the unit thrust into the force handed to the body.
    pub force_scale: f32,
    pub math_mode: MathMode,
    pub neighbor_policy: NeighborPolicy,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            ideal_separation: DEFAULT_IDEAL_SEPARATION,
            separation_threshold: DEFAULT_SEPARATION_THRESHOLD,
            gravity_bias: DEFAULT_GRAVITY_BIAS,
            force_scale: DEFAULT_FORCE_SCALE,
            math_mode: MathMode::Accurate,
            neighbor_policy: NeighborPolicy::Nearest,
        }
    }
}

impl MemberConfig {
    pub fn validate(&self) -> SwarmResult<()> {
        validate_separation(self.ideal_separation, self.separation_threshold)?;
        if !self.gravity_bias.is_finite() {
            return Err(SwarmError::InvalidConfig(format!(
                "gravity bias must be finite, got {}",
                self.gravity_bias
            )));
        }
        if !self.force_scale.is_finite() || self.force_scale < 0.0 {
            return Err(SwarmError::InvalidConfig(format!(
                "force scale must be finite and non-negative, got {}",
                self.force_scale
            )));
        }
        Ok(())
    }
}

/// Checks `ideal > 0` and `0 <= threshold < ideal`.
pub fn validate_separation(ideal: f32, threshold: f32) -> SwarmResult<()> {
    if !ideal.is_finite() || ideal <= 0.0 {
        return Err(SwarmError::InvalidIdealSeparation(ideal));
    }
    if !threshold.is_finite() || threshold < 0.0 || threshold >= ideal {
        return Err(SwarmError::InvalidThreshold { threshold, ideal });
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub member: MemberConfig,
    pub discovery: Discovery,
    /// Area the lattice should cover. When set, the ideal separation follows the
    /// population size; otherwise it stays at `member.ideal_separation`.
    pub lift_area: Option<f32>,
    pub min_separation: f32,
    pub max_separation: f32,
    /// When set, the broadcast thrust points from the swarm centroid to this point.
    pub lift_target: Option<Vec3>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            member: MemberConfig::default(),
            discovery: Discovery::default(),
            lift_area: None,
            min_separation: DEFAULT_MIN_SEPARATION,
            max_separation: DEFAULT_MAX_SEPARATION,
            lift_target: None,
        }
    }
}

impl SwarmConfig {
    pub fn from_json(json: &str) -> SwarmResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SwarmResult<()> {
        self.member.validate()?;

        if let Some(area) = self.lift_area {
            if !area.is_finite() || area <= 0.0 {
                return Err(SwarmError::InvalidConfig(format!(
                    "lift area must be finite and positive, got {area}"
                )));
            }
            // Every separation the area can produce must clear the threshold.
            if !self.min_separation.is_finite()
                || !self.max_separation.is_finite()
                || self.min_separation <= self.member.separation_threshold
                || self.min_separation > self.max_separation
            {
                return Err(SwarmError::InvalidConfig(format!(
                    "separation clamp [{}, {}] must be finite, ordered and above the threshold {}",
                    self.min_separation, self.max_separation, self.member.separation_threshold
                )));
            }
        }

        if let Discovery::Grid { radius_factor } = self.discovery {
            if !radius_factor.is_finite() || radius_factor <= 0.0 {
                return Err(SwarmError::InvalidConfig(format!(
                    "grid radius factor must be finite and positive, got {radius_factor}"
                )));
            }
        }

        if let Some(target) = self.lift_target {
            if !target.is_finite() {
                return Err(SwarmError::InvalidConfig(
                    "lift target must be finite".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Ideal separation for `population` members.
    ///
    /// A triangular lattice with spacing `s` spends `sqrt(3)/2 * s^2` of area per
    /// node, so covering `lift_area` with `n` nodes needs `s = sqrt(2A / (sqrt(3) n))`.
    pub fn separation_for(&self, population: usize) -> f32 {
        let Some(area) = self.lift_area else {
            return self.member.ideal_separation;
        };
        if population == 0 {
            return self.member.ideal_separation;
        }

        let spacing = (2.0 * area / (3.0_f32.sqrt() * population as f32)).sqrt();
        clamp_finite(
            spacing,
            self.min_separation,
            self.max_separation,
            self.member.ideal_separation,
        )
    }
}

pub fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if !value.is_finite() {
        return fallback;
    }
    value.clamp(min, max)
}
