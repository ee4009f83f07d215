//! Voxel coordinates and the small amount of vector math the skeleton needs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Integer voxel coordinate (0-based, dataset space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Coordinate {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Convert to a float vector.
    pub fn to_float(self) -> FloatCoordinate {
        FloatCoordinate::new(self.x as f32, self.y as f32, self.z as f32)
    }

    /// Euclidean distance to another coordinate.
    pub fn distance(self, other: Coordinate) -> f32 {
        (self.to_float() - other.to_float()).length()
    }

    /// Squared euclidean distance, computed in 64-bit integers.
    ///
    /// Used for nearest-node comparisons so ties are exact.
    pub fn distance_squared(self, other: Coordinate) -> i64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        let dz = i64::from(self.z) - i64::from(other.z);
        dx * dx + dy * dy + dz * dz
    }

    /// Shift by one on every axis (0-based to 1-based, as written to NML).
    ///
    /// `None` if an axis sits at `i32::MAX` and has no 1-based form.
    pub fn to_wire(self) -> Option<Self> {
        Some(Self::new(
            self.x.checked_add(1)?,
            self.y.checked_add(1)?,
            self.z.checked_add(1)?,
        ))
    }

    /// Inverse of [`Coordinate::to_wire`].
    pub fn from_wire(self) -> Option<Self> {
        Some(Self::new(
            self.x.checked_sub(1)?,
            self.y.checked_sub(1)?,
            self.z.checked_sub(1)?,
        ))
    }
}

impl Add for Coordinate {
    type Output = Coordinate;

    fn add(self, rhs: Coordinate) -> Coordinate {
        Coordinate::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Coordinate {
    type Output = Coordinate;

    fn sub(self, rhs: Coordinate) -> Coordinate {
        Coordinate::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Floating-point 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FloatCoordinate {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl FloatCoordinate {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: FloatCoordinate) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: FloatCoordinate) -> FloatCoordinate {
        FloatCoordinate::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector in the same direction, or `None` for the zero vector.
    pub fn normalized(self) -> Option<FloatCoordinate> {
        let len = self.length();
        if len == 0.0 {
            None
        } else {
            Some(FloatCoordinate::new(self.x / len, self.y / len, self.z / len))
        }
    }

    /// Component-wise scaling, e.g. voxel to physical units.
    pub fn scaled(self, scale: FloatCoordinate) -> FloatCoordinate {
        FloatCoordinate::new(self.x * scale.x, self.y * scale.y, self.z * scale.z)
    }

    /// Round to the nearest voxel.
    pub fn round(self) -> Coordinate {
        Coordinate::new(
            self.x.round() as i32,
            self.y.round() as i32,
            self.z.round() as i32,
        )
    }
}

impl Add for FloatCoordinate {
    type Output = FloatCoordinate;

    fn add(self, rhs: FloatCoordinate) -> FloatCoordinate {
        FloatCoordinate::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for FloatCoordinate {
    type Output = FloatCoordinate;

    fn sub(self, rhs: FloatCoordinate) -> FloatCoordinate {
        FloatCoordinate::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Angle between two vectors in radians, `None` if either is zero.
pub fn angle_between(a: FloatCoordinate, b: FloatCoordinate) -> Option<f32> {
    let denom = a.length() * b.length();
    if denom == 0.0 {
        return None;
    }
    // Clamp: rounding can push the cosine slightly outside [-1, 1].
    Some((a.dot(b) / denom).clamp(-1.0, 1.0).acos())
}
