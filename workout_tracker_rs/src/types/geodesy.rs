use geo::{HaversineDestination, HaversineDistance, Point};
use serde::{Deserialize, Serialize};

use super::linalg::{PlanarVec, EAST, NORTH};

/// Mean earth radius used by `geo`'s haversine (metres).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Great-circle distance in metres.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        self.point().haversine_distance(&other.point())
    }

    /// Point `distance_m` away along `bearing_deg` (0 = north, clockwise).
    pub fn destination(&self, bearing_deg: f64, distance_m: f64) -> Coordinate {
        let p = self.point().haversine_destination(bearing_deg, distance_m);
        Coordinate::new(p.y(), p.x())
    }

    /// Equirectangular offset from `self` to `other` in metres (north, east).
    pub fn offset_to(&self, other: &Coordinate) -> PlanarVec {
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();
        let north = EARTH_RADIUS_M * d_lat;
        let east = EARTH_RADIUS_M * d_lon * self.latitude.to_radians().cos();
        PlanarVec::new(north, east)
    }

    /// Shift by a local (north, east) offset in metres.
    pub fn shifted(&self, offset: &PlanarVec) -> Coordinate {
        let d_lat = offset[NORTH] / EARTH_RADIUS_M;
        let d_lon = offset[EAST] / (EARTH_RADIUS_M * self.latitude.to_radians().cos());
        Coordinate::new(
            self.latitude + d_lat.to_degrees(),
            self.longitude + d_lon.to_degrees(),
        )
    }
}
