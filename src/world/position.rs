use std::f64::consts::TAU;

/// A spot in world coordinates, in the client's world units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Headings are 12 bits, 4096 units per full circle.
pub const HEADING_MAX: u16 = 0x0fff;

const HEADING_UNITS_PER_CIRCLE: f64 = 4096.0;

impl Point3D {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(self, other: Point3D) -> f64 {
        let dx = f64::from(other.x - self.x);
        let dy = f64::from(other.y - self.y);
        let dz = f64::from(other.z - self.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn plane_distance_to(self, other: Point3D) -> f64 {
        let dx = f64::from(other.x - self.x);
        let dy = f64::from(other.y - self.y);
        (dx * dx + dy * dy).sqrt()
    }

    /// Distance with the on-ground convention: when either side has Z
    /// exactly 0, the Z axis is ignored entirely.
    pub fn legacy_distance_to(self, other: Point3D) -> f64 {
        if self.z == 0 || other.z == 0 {
            self.plane_distance_to(other)
        } else {
            self.distance_to(other)
        }
    }

    pub fn within_radius(self, other: Point3D, radius: i32) -> bool {
        self.distance_to(other) <= f64::from(radius)
    }
}

/// 12-bit heading from a spot towards a target spot. North is -Y and
/// heading 0; east is a quarter turn (1024).
pub fn heading_to_spot(from: Point3D, tx: i32, ty: i32) -> u16 {
    let dx = f64::from(tx - from.x);
    let dy = f64::from(from.y - ty);
    if dx == 0.0 && dy == 0.0 {
        return 0;
    }
    let mut heading = dx.atan2(dy) * HEADING_UNITS_PER_CIRCLE / TAU;
    if heading < 0.0 {
        heading += HEADING_UNITS_PER_CIRCLE;
    }
    (heading as u32 as u16) & HEADING_MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_cardinal_directions() {
        let origin = Point3D::new(1000, 1000, 0);
        assert_eq!(heading_to_spot(origin, 1000, 0), 0);
        assert_eq!(heading_to_spot(origin, 2000, 1000), 1024);
        assert_eq!(heading_to_spot(origin, 1000, 2000), 2048);
        assert_eq!(heading_to_spot(origin, 0, 1000), 3072);
    }

    #[test]
    fn heading_stays_in_twelve_bits() {
        let origin = Point3D::default();
        for (tx, ty) in [(5, 3), (-5, 3), (-5, -3), (5, -3), (0, 7), (7, 0)] {
            assert!(heading_to_spot(origin, tx, ty) <= HEADING_MAX);
        }
    }

    #[test]
    fn heading_same_spot_is_zero() {
        let origin = Point3D::new(42, 42, 0);
        assert_eq!(heading_to_spot(origin, 42, 42), 0);
    }

    #[test]
    fn legacy_distance_drops_z_when_on_ground() {
        let a = Point3D::new(0, 0, 0);
        let b = Point3D::new(300, 400, 9999);
        assert_eq!(a.legacy_distance_to(b), 500.0);

        let a = Point3D::new(0, 0, 100);
        let b = Point3D::new(0, 0, 400);
        assert_eq!(a.legacy_distance_to(b), 300.0);
    }

    #[test]
    fn within_radius_boundary() {
        let a = Point3D::new(0, 0, 0);
        assert!(a.within_radius(Point3D::new(500, 0, 0), 500));
        assert!(!a.within_radius(Point3D::new(501, 0, 0), 500));
    }
}
