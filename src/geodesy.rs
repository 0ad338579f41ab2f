// Geodesy module - station separation on the WGS84 ellipsoid
//
// Provides:
// - Ellipsoidal (Vincenty inverse) distance between two lat/lon points
// - Spherical great-circle distance, used when Vincenty fails to converge
//   for nearly antipodal points

use std::f64::consts::PI;

use tracing::warn;

use crate::error::{DriftError, Result};

/// Degrees to radians conversion factor
const DTOR: f64 = PI / 180.0;

/// WGS84 ellipsoid semi-major axis (equatorial radius) in meters
const WGS84_A: f64 = 6378137.0;

/// WGS84 ellipsoid flattening factor
const WGS84_F: f64 = 1.0 / 298.257223563;

/// WGS84 ellipsoid semi-minor axis (polar radius) in meters
const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);

/// Average radius for spherical Earth approximation in meters
const SPHERICAL_R: f64 = 6371e3;

/// Vincenty iteration limit and convergence threshold (radians)
const VINCENTY_MAX_ITER: usize = 200;
const VINCENTY_EPS: f64 = 1e-12;

fn check_coordinate(lat: f64, lon: f64) -> Result<()> {
    if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
        return Err(DriftError::InvalidCoordinate { lat, lon });
    }
    Ok(())
}

/// Returns the geodesic distance in meters between two points on the WGS84
/// ellipsoid.
///
/// # Arguments
/// * `lat0`, `lon0` - First point (latitude, longitude) in degrees
/// * `lat1`, `lon1` - Second point (latitude, longitude) in degrees
///
/// # Errors
/// `InvalidCoordinate` if a latitude is outside [-90, 90], a longitude is
/// outside [-180, 180], or either is not finite.
///
/// # Example
/// ```
/// let d = obs_clockdrift::geodesy::distance(0.0, 0.0, 0.0, 1.0).unwrap();
/// assert!((d - 111_319.49).abs() < 0.01);
/// ```
pub fn distance(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> Result<f64> {
    check_coordinate(lat0, lon0)?;
    check_coordinate(lat1, lon1)?;

    match vincenty_inverse(lat0, lon0, lat1, lon1) {
        Some(d) => Ok(d),
        None => {
            warn!(lat0, lon0, lat1, lon1, "Vincenty did not converge, using spherical distance");
            Ok(greatcircle(lat0, lon0, lat1, lon1))
        }
    }
}

/// Vincenty's inverse formula. Returns `None` if the iteration does not
/// converge (nearly antipodal points).
fn vincenty_inverse(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> Option<f64> {
    let l = (lon1 - lon0) * DTOR;
    let u1 = ((1.0 - WGS84_F) * (lat0 * DTOR).tan()).atan();
    let u2 = ((1.0 - WGS84_F) * (lat1 * DTOR).tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    for _ in 0..VINCENTY_MAX_ITER {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        let sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            // Coincident points
            return Some(0.0);
        }
        let cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        let sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        // Equatorial line: cos_sq_alpha = 0
        let cos_2sigma_m = if cos_sq_alpha != 0.0 {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        } else {
            0.0
        };
        let c = WGS84_F / 16.0 * cos_sq_alpha * (4.0 + WGS84_F * (4.0 - 3.0 * cos_sq_alpha));
        let lambda_prev = lambda;
        lambda = l
            + (1.0 - c)
                * WGS84_F
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

        if (lambda - lambda_prev).abs() < VINCENTY_EPS {
            let u_sq = cos_sq_alpha * (WGS84_A * WGS84_A - WGS84_B * WGS84_B) / (WGS84_B * WGS84_B);
            let a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
            let b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
            let delta_sigma = b
                * sin_sigma
                * (cos_2sigma_m
                    + b / 4.0
                        * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                            - b / 6.0
                                * cos_2sigma_m
                                * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                                * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));
            return Some(WGS84_B * a * (sigma - delta_sigma));
        }
    }
    None
}

/// Returns great-circle distance in meters between two lat/lon points
///
/// **Assumes spherical Earth**. Accuracy is ~0.5% for most purposes.
///
/// # Example
/// ```
/// let d = obs_clockdrift::geodesy::greatcircle(51.5, -0.1, 48.8, 2.3); // London to Paris
/// assert!((d - 344_000.0).abs() < 5_000.0);
/// ```
pub fn greatcircle(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> f64 {
    let lat0_rad = lat0 * DTOR;
    let lon0_rad = lon0 * DTOR;
    let lat1_rad = lat1 * DTOR;
    let lon1_rad = lon1 * DTOR;

    let cos_angle = lat0_rad.sin() * lat1_rad.sin()
        + lat0_rad.cos() * lat1_rad.cos() * (lon0_rad - lon1_rad).abs().cos();
    SPHERICAL_R * cos_angle.clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_equator_one_degree() {
        // Along the equator the geodesic is the equator itself: a * dlon
        let d = distance(0.0, 0.0, 0.0, 1.0).unwrap();
        assert!((d - WGS84_A * DTOR).abs() < 1e-3, "Distance: {} meters", d);
    }

    #[test]
    fn test_distance_meridian_one_degree() {
        let d = distance(0.0, 0.0, 1.0, 0.0).unwrap();
        assert!((d - 110_574.4).abs() < 1.0, "Distance: {} meters", d);
    }

    #[test]
    fn test_distance_london_paris() {
        let d = distance(51.5074, -0.1278, 48.8566, 2.3522).unwrap();
        assert!((d - 344_000.0).abs() < 2_000.0, "Distance: {} meters", d);
    }

    #[test]
    fn test_distance_symmetric_and_zero() {
        let d01 = distance(-38.2, 176.1, -37.9, 177.4).unwrap();
        let d10 = distance(-37.9, 177.4, -38.2, 176.1).unwrap();
        assert!((d01 - d10).abs() < 1e-6);
        assert_eq!(distance(12.0, 34.0, 12.0, 34.0).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_near_antipodal_falls_back() {
        let d = distance(0.0, 0.0, 0.5, 179.7).unwrap();
        assert!(d.is_finite());
        assert!(d > 1.9e7, "Distance: {} meters", d);
    }

    #[test]
    fn test_distance_invalid_coordinate() {
        assert_eq!(
            distance(91.0, 0.0, 0.0, 0.0),
            Err(DriftError::InvalidCoordinate { lat: 91.0, lon: 0.0 })
        );
        assert!(distance(0.0, 0.0, 0.0, 181.0).is_err());
        assert!(distance(f64::NAN, 0.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_greatcircle_same_point() {
        let dist = greatcircle(51.5, -0.1, 51.5, -0.1);
        assert!(dist.abs() < 1e-6);
    }

    #[test]
    fn test_constants() {
        assert!((WGS84_A - 6378137.0).abs() < 1e-9);
        assert!((WGS84_F - 1.0 / 298.257223563).abs() < 1e-15);
        assert!((WGS84_B - WGS84_A * (1.0 - WGS84_F)).abs() < 1e-9);
    }
}
