//! Small geographic helpers shared by sources and the aggregator.

use std::cmp::Ordering;

use crate::model::{Coordinates, NearbyStation};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Tolerance in degrees for treating two coordinates as the same point.
pub const COORDINATE_TOLERANCE_DEG: f64 = 0.0001;

/// Great-circle distance in kilometers between two points.
pub fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    let lat1_rad = from.latitude.to_radians();
    let lat2_rad = to.latitude.to_radians();
    let delta_lat = (to.latitude - from.latitude).to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Axis-aligned lat/lon rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_ne: f64,
    pub lon_ne: f64,
    pub lat_sw: f64,
    pub lon_sw: f64,
}

impl BoundingBox {
    /// Box extending `half_width_deg` from `center` in every direction.
    pub fn around(center: Coordinates, half_width_deg: f64) -> Self {
        Self {
            lat_ne: center.latitude + half_width_deg,
            lon_ne: center.longitude + half_width_deg,
            lat_sw: center.latitude - half_width_deg,
            lon_sw: center.longitude - half_width_deg,
        }
    }
}

pub fn same_point(a: Coordinates, b: Coordinates) -> bool {
    (a.latitude - b.latitude).abs() < COORDINATE_TOLERANCE_DEG
        && (a.longitude - b.longitude).abs() < COORDINATE_TOLERANCE_DEG
}

/// Stable sort by ascending distance; stations without a distance go last
/// and keep their relative order.
pub fn sort_by_distance(stations: &mut [NearbyStation]) {
    stations.sort_by(|a, b| match (a.distance_km, b.distance_km) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(id: &str, distance_km: Option<f64>) -> NearbyStation {
        NearbyStation {
            id: id.to_string(),
            display_name: id.to_string(),
            latitude: None,
            longitude: None,
            distance_km,
            source_name: "test".to_string(),
        }
    }

    #[test]
    fn haversine_identical_points_is_zero() {
        let p = Coordinates::new(46.30, 25.30);
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn haversine_one_degree_of_longitude_at_equator() {
        let d = haversine_km(Coordinates::new(0.0, 0.0), Coordinates::new(0.0, 1.0));
        assert!((d - 111.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn haversine_london_to_edinburgh() {
        let d = haversine_km(
            Coordinates::new(51.5074, -0.1278),
            Coordinates::new(55.9533, -3.1883),
        );
        assert!((d - 534.0).abs() < 10.0);
    }

    #[test]
    fn bounding_box_extends_in_every_direction() {
        let bbox = BoundingBox::around(Coordinates::new(46.30, 25.30), 0.05);
        assert!((bbox.lat_ne - 46.35).abs() < 1e-9);
        assert!((bbox.lon_ne - 25.35).abs() < 1e-9);
        assert!((bbox.lat_sw - 46.25).abs() < 1e-9);
        assert!((bbox.lon_sw - 25.25).abs() < 1e-9);
    }

    #[test]
    fn same_point_uses_tolerance() {
        let a = Coordinates::new(46.30, 25.30);
        assert!(same_point(a, Coordinates::new(46.30005, 25.29995)));
        assert!(!same_point(a, Coordinates::new(46.3002, 25.30)));
    }

    #[test]
    fn sort_puts_missing_distances_last_in_arrival_order() {
        let mut stations = vec![
            station("none-1", None),
            station("far", Some(4.2)),
            station("none-2", None),
            station("near", Some(0.5)),
            station("tie-a", Some(2.0)),
            station("tie-b", Some(2.0)),
        ];

        sort_by_distance(&mut stations);

        let ids: Vec<_> = stations.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["near", "tie-a", "tie-b", "far", "none-1", "none-2"]);
    }
}
