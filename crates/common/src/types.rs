use glam::{DVec3, I64Vec3, Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer world-space coordinate. Tile positions and the world origin use this.
pub type IntVector = I64Vec3;

/// Unique identifier for an actor inside a level package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Spatial transform: position, rotation, scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

/// Axis-aligned bounding box.
///
/// A box may be invalid, meaning "not computed yet". Invalid boxes never take
/// part in distance or overlap tests; callers fall back to a point instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
    pub valid: bool,
}

impl Default for Bounds {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Bounds {
    pub const INVALID: Self = Self {
        min: Vec3::ZERO,
        max: Vec3::ZERO,
        valid: false,
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Grow to contain `other`. Invalid operands are ignored.
    pub fn union(self, other: Bounds) -> Bounds {
        match (self.valid, other.valid) {
            (false, _) => other,
            (_, false) => self,
            _ => Bounds::new(self.min.min(other.min), self.max.max(other.max)),
        }
    }

    /// The same box in absolute double precision, placed at `offset`.
    pub fn placed_at(&self, offset: IntVector) -> Option<(DVec3, DVec3)> {
        if !self.valid {
            return None;
        }
        let o = offset.as_dvec3();
        Some((self.min.as_dvec3() + o, self.max.as_dvec3() + o))
    }
}

/// Distance on the XY plane from `point` to the box `[min, max]`; zero inside.
pub fn distance_2d_to_box(point: DVec3, min: DVec3, max: DVec3) -> f64 {
    let dx = (min.x - point.x).max(0.0).max(point.x - max.x);
    let dy = (min.y - point.y).max(0.0).max(point.y - max.y);
    (dx * dx + dy * dy).sqrt()
}
