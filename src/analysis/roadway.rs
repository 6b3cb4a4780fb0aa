// src/analysis/roadway.rs

use crate::types::Vec2;

/// Drivable area of a fixed camera view, as a simple polygon in pixel space.
#[derive(Debug, Clone)]
pub struct Roadway {
    vertices: Vec<Vec2>,
}

impl Roadway {
    /// `None` when fewer than three vertices are given.
    pub fn new(vertices: &[[f32; 2]]) -> Option<Self> {
        if vertices.len() < 3 {
            return None;
        }
        Some(Self {
            vertices: vertices.iter().map(|v| Vec2::new(v[0], v[1])).collect(),
        })
    }

    /// Even-odd ray casting. Points exactly on an edge may land on either side.
    pub fn contains(&self, p: Vec2) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.vertices[i];
            let vj = self.vertices[j];
            if (vi.y > p.y) != (vj.y > p.y) {
                let x_cross = vj.x + (p.y - vj.y) * (vi.x - vj.x) / (vi.y - vj.y);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trapezoid_roadway() {
        // Perspective road: narrow at the horizon, wide at the bottom
        let road = Roadway::new(&[[500.0, 300.0], [780.0, 300.0], [1280.0, 720.0], [0.0, 720.0]]).unwrap();
        assert!(road.contains(Vec2::new(640.0, 500.0)));
        assert!(road.contains(Vec2::new(100.0, 700.0)));
        assert!(!road.contains(Vec2::new(100.0, 320.0)), "sidewalk left of the horizon");
        assert!(!road.contains(Vec2::new(640.0, 100.0)), "sky");
    }

    #[test]
    fn test_too_few_vertices() {
        assert!(Roadway::new(&[[0.0, 0.0], [10.0, 0.0]]).is_none());
    }
}
