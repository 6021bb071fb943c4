//! Spatial utilities for the proximity engine
//!
//! This module provides geographic points, great-circle distance, the
//! bounding box around a radius query, and the geohash bucket grid the
//! spatial index partitions the plane with.

use crate::error::{ProximityError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius used for all distance calculations
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Padding added to bounding boxes so float rounding never drops an edge cell
const BBOX_PAD_DEG: f64 = 1e-7;

/// A geographic point on Earth's surface.
///
/// All coordinates use WGS84 decimal degrees.
///
/// # Examples
///
/// ```rust
/// use proximity::Point;
///
/// let gangnam = Point::new(37.4979, 127.0276);
/// let jamsil = Point::new(37.5133, 127.1001);
///
/// let distance_km = gangnam.distance_to(&jamsil) / 1000.0;
/// assert!(distance_km > 6.0 && distance_km < 7.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Latitude in decimal degrees (-90.0 to +90.0)
    pub lat: f64,
    /// Longitude in decimal degrees (-180.0 to +180.0)
    pub lon: f64,
}

impl Point {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Reject coordinates outside the WGS84 ranges (or not finite).
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(ProximityError::validation(
                "latitude",
                format!("must be between -90 and 90, got {}", self.lat),
            ));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(ProximityError::validation(
                "longitude",
                format!("must be between -180 and 180, got {}", self.lon),
            ));
        }
        Ok(())
    }

    /// Great-circle distance to `other` in meters (Haversine formula).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use proximity::Point;
    ///
    /// let seoul = Point::new(37.5547, 126.9707);
    /// assert_eq!(seoul.distance_to(&seoul), 0.0);
    /// ```
    pub fn distance_to(&self, other: &Point) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let half_dlat = (other.lat - self.lat).to_radians() * 0.5;
        let half_dlon = (other.lon - self.lon).to_radians() * 0.5;

        let sin_half_dlat = half_dlat.sin();
        let sin_half_dlon = half_dlon.sin();

        let a =
            sin_half_dlat * sin_half_dlat + lat1.cos() * lat2.cos() * sin_half_dlon * sin_half_dlon;
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }

    /// Geohash string for this point.
    ///
    /// # Arguments
    ///
    /// * `precision` - Number of characters in the geohash (1-12)
    pub fn to_geohash(&self, precision: usize) -> Result<String> {
        geohash::encode(
            geo::Coord {
                x: self.lon,
                y: self.lat,
            },
            precision,
        )
        .map_err(|e| ProximityError::InvalidGeohash(e.to_string()))
    }

    /// Snap both coordinates to `decimals` places
    pub fn rounded(&self, decimals: u32) -> Point {
        let scale = 10f64.powi(decimals as i32);
        Point::new(
            (self.lat * scale).round() / scale,
            (self.lon * scale).round() / scale,
        )
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

/// A latitude/longitude box.
///
/// Longitudes are left unwrapped: a box crossing the antimeridian has
/// `min_lon < -180` or `max_lon > 180`, and [`BucketGrid::cover`] wraps the
/// columns back onto the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Smallest box containing every point within `radius_meters` of `center`.
    ///
    /// A circle reaching a pole spans all longitudes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use proximity::{BoundingBox, Point};
    ///
    /// let bbox = BoundingBox::around(&Point::new(0.0, 179.99), 5_000.0);
    /// assert!(bbox.max_lon > 180.0); // crosses the antimeridian
    /// assert!(bbox.contains(&Point::new(0.0, -179.99)));
    /// ```
    pub fn around(center: &Point, radius_meters: f64) -> Self {
        let angular = radius_meters.max(0.0) / EARTH_RADIUS_M;
        let dlat = angular.to_degrees() + BBOX_PAD_DEG;

        let min_lat = center.lat - dlat;
        let max_lat = center.lat + dlat;

        if min_lat <= -90.0 || max_lat >= 90.0 || angular >= std::f64::consts::FRAC_PI_2 {
            return Self::new(min_lat.max(-90.0), -180.0, max_lat.min(90.0), 180.0);
        }

        let ratio = (angular.sin() / center.lat.to_radians().cos()).min(1.0);
        let dlon = ratio.asin().to_degrees() + BBOX_PAD_DEG;
        if dlon >= 180.0 {
            return Self::new(min_lat, -180.0, max_lat, 180.0);
        }

        Self::new(min_lat, center.lon - dlon, max_lat, center.lon + dlon)
    }

    pub fn spans_all_longitudes(&self) -> bool {
        self.max_lon - self.min_lon >= 360.0
    }

    /// Whether `point` falls inside the box, honouring antimeridian wrap.
    pub fn contains(&self, point: &Point) -> bool {
        if point.lat < self.min_lat || point.lat > self.max_lat {
            return false;
        }
        if self.spans_all_longitudes() {
            return true;
        }
        [point.lon - 360.0, point.lon, point.lon + 360.0]
            .iter()
            .any(|lon| *lon >= self.min_lon && *lon <= self.max_lon)
    }
}

/// Fixed-precision geohash grid used to bucket locations.
///
/// Each bucket is one geohash cell; `precision` trades index memory
/// (fewer, fuller buckets) against query fan-out (more cells per radius).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketGrid {
    precision: usize,
    rows: u64,
    cols: u64,
    cell_height: f64,
    cell_width: f64,
}

impl BucketGrid {
    pub const MAX_PRECISION: usize = 12;

    pub fn new(precision: usize) -> Result<Self> {
        if precision == 0 || precision > Self::MAX_PRECISION {
            return Err(ProximityError::InvalidGeohash(format!(
                "precision must be between 1 and {}, got {}",
                Self::MAX_PRECISION,
                precision
            )));
        }

        // Geohash interleaves bits starting with longitude
        let bits = 5 * precision as u32;
        let lon_bits = bits.div_ceil(2);
        let lat_bits = bits / 2;
        let rows = 1u64 << lat_bits;
        let cols = 1u64 << lon_bits;

        Ok(Self {
            precision,
            rows,
            cols,
            cell_height: 180.0 / rows as f64,
            cell_width: 360.0 / cols as f64,
        })
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    /// Bucket key for a point
    pub fn bucket_of(&self, point: &Point) -> Result<String> {
        point.to_geohash(self.precision)
    }

    fn row_range(&self, bbox: &BoundingBox) -> (u64, u64) {
        let last = self.rows - 1;
        let row = |lat: f64| (((lat + 90.0) / self.cell_height).floor().max(0.0) as u64).min(last);
        (row(bbox.min_lat), row(bbox.max_lat))
    }

    fn col_range(&self, bbox: &BoundingBox) -> (i64, i64) {
        if bbox.spans_all_longitudes() {
            return (0, self.cols as i64 - 1);
        }
        let col = |lon: f64| ((lon + 180.0) / self.cell_width).floor() as i64;
        let (start, end) = (col(bbox.min_lon), col(bbox.max_lon));
        if end - start + 1 >= self.cols as i64 {
            (0, self.cols as i64 - 1)
        } else {
            (start, end)
        }
    }

    /// Number of cells [`BucketGrid::cover`] would return for `bbox`
    pub fn cover_len(&self, bbox: &BoundingBox) -> u64 {
        let (row_start, row_end) = self.row_range(bbox);
        let (col_start, col_end) = self.col_range(bbox);
        (row_end - row_start + 1) * (col_end - col_start + 1) as u64
    }

    /// Every bucket key whose cell intersects `bbox`.
    ///
    /// Columns wrap across the antimeridian; rows clamp at the poles.
    pub fn cover(&self, bbox: &BoundingBox) -> Result<Vec<String>> {
        let (row_start, row_end) = self.row_range(bbox);
        let (col_start, col_end) = self.col_range(bbox);

        let mut cells = Vec::with_capacity(self.cover_len(bbox) as usize);
        for row in row_start..=row_end {
            let lat = -90.0 + (row as f64 + 0.5) * self.cell_height;
            for col in col_start..=col_end {
                let col = col.rem_euclid(self.cols as i64) as f64;
                let lon = -180.0 + (col + 0.5) * self.cell_width;
                cells.push(Point::new(lat, lon).to_geohash(self.precision)?);
            }
        }
        cells.sort_unstable();
        cells.dedup();
        Ok(cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_calculation() {
        let seoul_station = Point::new(37.5547, 126.9707);
        let gangnam = Point::new(37.4979, 127.0276);

        let distance = seoul_station.distance_to(&gangnam);
        // Roughly 8 km apart
        assert!((distance - 8_100.0).abs() < 500.0);
    }

    #[test]
    fn test_validate_ranges() {
        assert!(Point::new(90.0, 180.0).validate().is_ok());
        assert!(Point::new(-90.0, -180.0).validate().is_ok());
        assert!(Point::new(90.0001, 0.0).validate().is_err());
        assert!(Point::new(0.0, 180.0001).validate().is_err());
        assert!(Point::new(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn test_geohash_generation() {
        let point = Point::new(37.5, 127.0);
        let geohash = point.to_geohash(5).unwrap();
        assert_eq!(geohash.len(), 5);
        assert!(geohash.starts_with("wy"));
    }

    #[test]
    fn test_rounded() {
        let point = Point::new(37.498_765_4, 127.027_612_3);
        assert_eq!(point.rounded(4), Point::new(37.4988, 127.0276));
    }

    #[test]
    fn test_bbox_contains_radius() {
        let center = Point::new(37.5, 127.0);
        let bbox = BoundingBox::around(&center, 1_000.0);

        // 0.009 degrees latitude is roughly 1 km
        assert!(bbox.contains(&Point::new(37.5089, 127.0)));
        assert!(!bbox.contains(&Point::new(37.52, 127.0)));
        assert!(bbox.max_lon - bbox.min_lon > bbox.max_lat - bbox.min_lat);
    }

    #[test]
    fn test_bbox_at_pole_spans_all_longitudes() {
        let bbox = BoundingBox::around(&Point::new(89.99, 10.0), 5_000.0);
        assert!(bbox.spans_all_longitudes());
        assert_eq!(bbox.max_lat, 90.0);
        assert!(bbox.contains(&Point::new(89.995, -170.0)));
    }

    #[test]
    fn test_bucket_grid_rejects_bad_precision() {
        assert!(BucketGrid::new(0).is_err());
        assert!(BucketGrid::new(13).is_err());
        assert!(BucketGrid::new(12).is_ok());
    }

    #[test]
    fn test_cover_includes_point_bucket() {
        let grid = BucketGrid::new(5).unwrap();
        let center = Point::new(37.5, 127.0);
        let bbox = BoundingBox::around(&center, 5_000.0);
        let cells = grid.cover(&bbox).unwrap();

        assert!(cells.contains(&grid.bucket_of(&center).unwrap()));
        let near = Point::new(37.53, 127.03);
        assert!(cells.contains(&grid.bucket_of(&near).unwrap()));
        assert_eq!(cells.len() as u64, grid.cover_len(&bbox));
    }

    #[test]
    fn test_cover_wraps_antimeridian() {
        let grid = BucketGrid::new(4).unwrap();
        let bbox = BoundingBox::around(&Point::new(0.0, 179.99), 10_000.0);
        let cells = grid.cover(&bbox).unwrap();

        let east = grid.bucket_of(&Point::new(0.0, 179.995)).unwrap();
        let west = grid.bucket_of(&Point::new(0.0, -179.995)).unwrap();
        assert!(cells.contains(&east));
        assert!(cells.contains(&west));
    }

    #[test]
    fn test_cover_at_pole() {
        let grid = BucketGrid::new(2).unwrap();
        let bbox = BoundingBox::around(&Point::new(89.9, 0.0), 50_000.0);
        let cells = grid.cover(&bbox).unwrap();

        let far_side = grid.bucket_of(&Point::new(89.8, 179.0)).unwrap();
        assert!(cells.contains(&far_side));
    }

    #[test]
    fn test_point_display() {
        let point = Point::new(37.5, 127.0);
        assert_eq!(format!("{}", point), "(37.500000, 127.000000)");
    }
}
