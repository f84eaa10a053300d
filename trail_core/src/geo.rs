//! Great-circle geometry and pace helpers.

/// Mean Earth radius in meters (IUGG)
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Distance unit pace figures are normalized to
pub const PACE_DISTANCE_M: f64 = 500.0;

/// Haversine distance in meters between two lat/lng points (degrees)
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Point reached by travelling `distance_m` from a start along `bearing_deg`
pub fn destination(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    (phi2.to_degrees(), lambda2.to_degrees())
}

/// Seconds per 500 m, or `None` when no distance was covered
pub fn pace_secs(elapsed_secs: f64, distance_m: f64) -> Option<f64> {
    if distance_m <= f64::EPSILON || elapsed_secs <= 0.0 {
        return None;
    }
    Some(elapsed_secs / distance_m * PACE_DISTANCE_M)
}

/// Format a pace as `m:ss /500m`
pub fn format_pace(pace_secs: Option<f64>) -> String {
    match pace_secs {
        Some(secs) if secs.is_finite() => {
            let total = secs.round() as u64;
            format!("{}:{:02} /500m", total / 60, total % 60)
        }
        _ => "--:-- /500m".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km on the mean sphere
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 10.0, "got {}", d);
        assert_eq!(haversine_m(-5.7945, -35.2110, -5.7945, -35.2110), 0.0);
    }

    #[test]
    fn test_destination_inverts_haversine() {
        let (lat, lon) = destination(-5.7945, -35.2110, 45.0, 240.0);
        let d = haversine_m(-5.7945, -35.2110, lat, lon);
        assert!((d - 240.0).abs() < 0.01, "got {}", d);
    }

    #[test]
    fn test_pace() {
        assert_eq!(pace_secs(120.0, 500.0), Some(120.0));
        assert_eq!(pace_secs(10.0, 0.0), None);
        assert_eq!(format_pace(Some(125.4)), "2:05 /500m");
        assert_eq!(format_pace(None), "--:-- /500m");
    }
}
