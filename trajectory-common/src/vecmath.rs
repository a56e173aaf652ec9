use serde::{Deserialize, Serialize};
use std::ops::Sub;

/// A simple 2D vector struct.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    /// Creates a new Vec2.
    pub fn new(x: f64, y: f64) -> Self {
        Vec2 { x, y }
    }

    /// Calculates the squared length (magnitude) of the vector.
    pub fn length_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y
    }

    /// Calculates the squared distance to another vector (point).
    pub fn distance_squared(&self, other: Vec2) -> f64 {
        (*self - other).length_squared()
    }
}

impl Sub for Vec2 {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self { x: self.x - other.x, y: self.y - other.y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_squared_matches_component_sum() {
        let a = Vec2::new(1.0, 2.0);
        let b = Vec2::new(4.0, -2.0);
        assert_eq!(a.distance_squared(b), 25.0);
        assert_eq!((b - a).length_squared(), 25.0);
    }
}
