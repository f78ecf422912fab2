//! Measurement math and calibration
//!
//! Converts image-pixel geometry into physical quantities using the image's
//! pixel spacing. All distances are millimeters, angles degrees.

use crate::annotation::{AnnotationGeometry, Bounds, ImagePoint, MeasuredValue, ToolKind, Unit};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Physical size of one pixel
///
/// Rows run along the y axis, columns along the x axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelSpacing {
    /// Millimeters between adjacent rows
    pub row_mm: f64,
    /// Millimeters between adjacent columns
    pub column_mm: f64,
}

impl Default for PixelSpacing {
    /// Uncalibrated images measure in pixels
    fn default() -> Self {
        Self { row_mm: 1.0, column_mm: 1.0 }
    }
}

impl PixelSpacing {
    pub fn new(row_mm: f64, column_mm: f64) -> Self {
        Self { row_mm, column_mm }
    }

    /// Isotropic spacing
    pub fn uniform(mm: f64) -> Self {
        Self::new(mm, mm)
    }

    /// Check that both spacings are usable for scaling
    pub fn is_valid(&self) -> bool {
        self.row_mm.is_finite() && self.column_mm.is_finite() && self.row_mm > 0.0 && self.column_mm > 0.0
    }

    fn scale(&self, point: ImagePoint) -> ImagePoint {
        ImagePoint::new(point.x * self.column_mm, point.y * self.row_mm)
    }

    fn scale_bounds(&self, bounds: &Bounds) -> (f64, f64) {
        (bounds.width * self.column_mm, bounds.height * self.row_mm)
    }
}

/// Decimal places used when rounding computed values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementPrecision {
    pub length: u32,
    pub angle: u32,
    pub area: u32,
}

impl Default for MeasurementPrecision {
    fn default() -> Self {
        Self { length: 2, angle: 1, area: 2 }
    }
}

impl MeasurementPrecision {
    /// Precision applied to values of `unit`
    pub fn for_unit(&self, unit: Unit) -> u32 {
        match unit {
            Unit::Millimeters => self.length,
            Unit::Degrees => self.angle,
            Unit::SquareMillimeters => self.area,
        }
    }
}

/// Round half away from zero to `places` decimals
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Physical distance between two image points
pub fn length_mm(start: ImagePoint, end: ImagePoint, spacing: PixelSpacing) -> f64 {
    spacing.scale(start).distance_to(&spacing.scale(end))
}

/// Angle at `vertex` between the arms to `start` and `end`, in degrees.
///
/// Uses the law of cosines. A degenerate arm yields 0.
pub fn angle_degrees(start: ImagePoint, vertex: ImagePoint, end: ImagePoint, spacing: PixelSpacing) -> f64 {
    let (a, v, b) = (spacing.scale(start), spacing.scale(vertex), spacing.scale(end));
    let arm_a = v.distance_to(&a);
    let arm_b = v.distance_to(&b);
    if arm_a == 0.0 || arm_b == 0.0 {
        return 0.0;
    }
    let opposite = a.distance_to(&b);
    let cos = (arm_a * arm_a + arm_b * arm_b - opposite * opposite) / (2.0 * arm_a * arm_b);
    // Rounding error can push the cosine just outside [-1, 1]
    cos.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Area of an ellipse with semi-axes `a` and `b`
pub fn ellipse_area(a: f64, b: f64) -> f64 {
    PI * a * b
}

/// Ramanujan's first approximation of an ellipse perimeter
pub fn ellipse_perimeter(a: f64, b: f64) -> f64 {
    PI * (3.0 * (a + b) - ((3.0 * a + b) * (a + 3.0 * b)).sqrt())
}

pub fn rectangle_area(width: f64, height: f64) -> f64 {
    width * height
}

pub fn rectangle_perimeter(width: f64, height: f64) -> f64 {
    2.0 * (width + height)
}

/// Compute the value a measurement tool reports for `geometry`.
///
/// Returns `None` for annotation tools and for geometry whose shape does not
/// belong to `kind`.
pub fn measure(
    kind: ToolKind,
    geometry: &AnnotationGeometry,
    spacing: PixelSpacing,
    precision: MeasurementPrecision,
) -> Option<MeasuredValue> {
    let unit = kind.unit()?;
    let places = precision.for_unit(unit);

    let (value, perimeter) = match (kind, geometry) {
        (ToolKind::Length, AnnotationGeometry::Segment { start, end }) => {
            (length_mm(*start, *end, spacing), None)
        }
        (ToolKind::Angle, AnnotationGeometry::Angle { start, vertex, end }) => {
            (angle_degrees(*start, *vertex, *end, spacing), None)
        }
        (ToolKind::EllipticalArea, AnnotationGeometry::Region { bounds }) => {
            let (width, height) = spacing.scale_bounds(bounds);
            let (a, b) = (width / 2.0, height / 2.0);
            (ellipse_area(a, b), Some(ellipse_perimeter(a, b)))
        }
        (ToolKind::RectangularArea, AnnotationGeometry::Region { bounds }) => {
            let (width, height) = spacing.scale_bounds(bounds);
            (rectangle_area(width, height), Some(rectangle_perimeter(width, height)))
        }
        _ => return None,
    };

    Some(MeasuredValue {
        value: round_to(value, places),
        unit,
        perimeter: perimeter.map(|p| round_to(p, precision.length)),
    })
}
