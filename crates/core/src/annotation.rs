//! Canonical annotation data model
//!
//! Every tool (text, arrow, length, angle, area) produces the same
//! tool-agnostic [`AnnotationRecord`]. The shape of a record's geometry is
//! fixed by its tool kind and can never change after creation.
//! All coordinates are image-local (pixels, origin at the top-left).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an annotation record
///
/// Globally unique and immutable for the life of the record.
/// Generated using UUID v4.
pub type AnnotationId = uuid::Uuid;

/// Error types for record construction and validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("{kind} records need {expected:?} geometry, got {found:?}")]
    ShapeMismatch {
        kind: ToolKind,
        expected: GeometryShape,
        found: GeometryShape,
    },

    #[error("{kind} geometry needs {expected} points, got {found}")]
    PointCount {
        kind: ToolKind,
        expected: usize,
        found: usize,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("geometry contains a non-finite coordinate")]
    NonFiniteCoordinate,

    #[error("unknown tool kind: {0}")]
    UnknownToolKind(String),
}

/// Result type for record operations
pub type RecordResult<T> = Result<T, RecordError>;

/// Closed set of annotation and measurement tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    /// Free-text label anchored at a point
    Text,
    /// Directional marker from a tail to a head
    Arrow,
    /// Straight-line distance between two points
    Length,
    /// Angle at a vertex between two arms
    Angle,
    /// Area of an ellipse inscribed in a bounding box
    EllipticalArea,
    /// Area of an axis-aligned rectangle
    RectangularArea,
}

impl ToolKind {
    /// Every tool kind
    pub const ALL: [ToolKind; 6] = [
        ToolKind::Text,
        ToolKind::Arrow,
        ToolKind::Length,
        ToolKind::Angle,
        ToolKind::EllipticalArea,
        ToolKind::RectangularArea,
    ];

    /// Mutually exclusive measurement tools, in the fixed merge order
    pub const MEASUREMENTS: [ToolKind; 4] = [
        ToolKind::Length,
        ToolKind::Angle,
        ToolKind::EllipticalArea,
        ToolKind::RectangularArea,
    ];

    /// Annotation tools that may coexist with an active measurement tool
    pub const ANNOTATIONS: [ToolKind; 2] = [ToolKind::Text, ToolKind::Arrow];

    /// Whether this tool belongs to the single-active measurement group
    pub fn is_measurement(self) -> bool {
        Self::MEASUREMENTS.contains(&self)
    }

    /// The geometry shape every record of this kind carries
    pub fn shape(self) -> GeometryShape {
        match self {
            ToolKind::Text => GeometryShape::Anchor,
            ToolKind::Arrow | ToolKind::Length => GeometryShape::Segment,
            ToolKind::Angle => GeometryShape::Angle,
            ToolKind::EllipticalArea | ToolKind::RectangularArea => GeometryShape::Region,
        }
    }

    /// Unit of the computed value, `None` for non-measurement tools
    pub fn unit(self) -> Option<Unit> {
        match self {
            ToolKind::Text | ToolKind::Arrow => None,
            ToolKind::Length => Some(Unit::Millimeters),
            ToolKind::Angle => Some(Unit::Degrees),
            ToolKind::EllipticalArea | ToolKind::RectangularArea => {
                Some(Unit::SquareMillimeters)
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Text => "text",
            ToolKind::Arrow => "arrow",
            ToolKind::Length => "length",
            ToolKind::Angle => "angle",
            ToolKind::EllipticalArea => "elliptical-area",
            ToolKind::RectangularArea => "rectangular-area",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| RecordError::UnknownToolKind(s.to_owned()))
    }
}

/// Image-local coordinate in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImagePoint {
    pub x: f64,
    pub y: f64,
}

impl ImagePoint {
    /// Create a new image point
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Calculate distance to another point
    pub fn distance_to(&self, other: &ImagePoint) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned bounding region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Normalized bounds spanned by two opposite corners, in any order
    pub fn from_corners(a: ImagePoint, b: ImagePoint) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    pub fn center(&self) -> ImagePoint {
        ImagePoint::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    fn is_finite(&self) -> bool {
        [self.x, self.y, self.width, self.height].iter().all(|v| v.is_finite())
    }
}

/// Shape discriminant of [`AnnotationGeometry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryShape {
    /// One point
    Anchor,
    /// Exactly two points
    Segment,
    /// Exactly three points, the middle one being the vertex
    Angle,
    /// A bounding region
    Region,
}

impl GeometryShape {
    /// Number of raw points a tool emits to describe this shape
    pub fn raw_point_count(self) -> usize {
        match self {
            GeometryShape::Anchor => 1,
            GeometryShape::Segment | GeometryShape::Region => 2,
            GeometryShape::Angle => 3,
        }
    }
}

/// Geometric payload of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum AnnotationGeometry {
    /// Text anchor position
    Anchor { position: ImagePoint },

    /// Arrow or length: tail/start to head/end
    Segment { start: ImagePoint, end: ImagePoint },

    /// Angle measured at `vertex` between the arms to `start` and `end`
    Angle {
        start: ImagePoint,
        vertex: ImagePoint,
        end: ImagePoint,
    },

    /// Elliptical or rectangular area
    Region { bounds: Bounds },
}

impl AnnotationGeometry {
    /// Build the geometry for `kind` from the raw points a tool reported.
    ///
    /// Region tools report two opposite corners.
    pub fn from_points(kind: ToolKind, points: &[ImagePoint]) -> RecordResult<Self> {
        let expected = kind.shape().raw_point_count();
        if points.len() != expected {
            return Err(RecordError::PointCount { kind, expected, found: points.len() });
        }
        let geometry = match kind.shape() {
            GeometryShape::Anchor => AnnotationGeometry::Anchor { position: points[0] },
            GeometryShape::Segment => AnnotationGeometry::Segment { start: points[0], end: points[1] },
            GeometryShape::Angle => AnnotationGeometry::Angle {
                start: points[0],
                vertex: points[1],
                end: points[2],
            },
            GeometryShape::Region => AnnotationGeometry::Region {
                bounds: Bounds::from_corners(points[0], points[1]),
            },
        };
        geometry.check_finite()?;
        Ok(geometry)
    }

    pub fn shape(&self) -> GeometryShape {
        match self {
            AnnotationGeometry::Anchor { .. } => GeometryShape::Anchor,
            AnnotationGeometry::Segment { .. } => GeometryShape::Segment,
            AnnotationGeometry::Angle { .. } => GeometryShape::Angle,
            AnnotationGeometry::Region { .. } => GeometryShape::Region,
        }
    }

    /// Defining points; regions yield their two corners
    pub fn points(&self) -> Vec<ImagePoint> {
        match self {
            AnnotationGeometry::Anchor { position } => vec![*position],
            AnnotationGeometry::Segment { start, end } => vec![*start, *end],
            AnnotationGeometry::Angle { start, vertex, end } => vec![*start, *vertex, *end],
            AnnotationGeometry::Region { bounds } => vec![
                ImagePoint::new(bounds.x, bounds.y),
                ImagePoint::new(bounds.x + bounds.width, bounds.y + bounds.height),
            ],
        }
    }

    /// First defining point (used by flattened exports)
    pub fn first_point(&self) -> ImagePoint {
        match self {
            AnnotationGeometry::Anchor { position } => *position,
            AnnotationGeometry::Segment { start, .. } | AnnotationGeometry::Angle { start, .. } => {
                *start
            }
            AnnotationGeometry::Region { bounds } => ImagePoint::new(bounds.x, bounds.y),
        }
    }

    fn check_finite(&self) -> RecordResult<()> {
        let finite = match self {
            AnnotationGeometry::Region { bounds } => bounds.is_finite(),
            other => other.points().iter().all(ImagePoint::is_finite),
        };
        if finite {
            Ok(())
        } else {
            Err(RecordError::NonFiniteCoordinate)
        }
    }
}

/// Unit of a computed measurement value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "mm")]
    Millimeters,
    #[serde(rename = "deg")]
    Degrees,
    #[serde(rename = "mm2")]
    SquareMillimeters,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Millimeters => "mm",
            Unit::Degrees => "°",
            Unit::SquareMillimeters => "mm²",
        }
    }
}

/// Computed scalar value of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasuredValue {
    pub value: f64,
    pub unit: Unit,
    /// Perimeter in millimeters, areas only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perimeter: Option<f64>,
}

impl MeasuredValue {
    /// Formatted label, e.g. `12.00 mm²`
    pub fn label(&self, precision: u32) -> String {
        format!("{:.*} {}", precision as usize, self.value, self.unit.symbol())
    }
}

/// Patient/study/series correlation, passed through untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_uid: Option<String>,
}

impl Correlation {
    pub fn is_empty(&self) -> bool {
        self.patient_id.is_none() && self.study_uid.is_none() && self.series_uid.is_none()
    }
}

/// Canonical, tool-agnostic annotation or measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    /// Stable unique identifier
    id: AnnotationId,

    /// Tool that produced the record
    kind: ToolKind,

    /// Geometry; its shape is fixed by `kind`
    geometry: AnnotationGeometry,

    /// Computed value, measurement tools only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    measurement: Option<MeasuredValue>,

    /// Free-text label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,

    /// Owning image
    image_id: String,

    /// Owning viewport
    viewport_id: String,

    created_at: DateTime<Utc>,

    modified_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Correlation::is_empty")]
    correlation: Correlation,
}

impl AnnotationRecord {
    /// Create a new record with a generated ID
    pub fn new(
        kind: ToolKind,
        geometry: AnnotationGeometry,
        image_id: impl Into<String>,
        viewport_id: impl Into<String>,
    ) -> RecordResult<Self> {
        let now = Utc::now();
        let record = Self {
            id: AnnotationId::new_v4(),
            kind,
            geometry,
            measurement: None,
            label: None,
            image_id: image_id.into(),
            viewport_id: viewport_id.into(),
            created_at: now,
            modified_at: now,
            correlation: Correlation::default(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Replace the generated ID (for records whose ID was assigned upstream)
    pub fn with_id(mut self, id: AnnotationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label.filter(|l| !l.is_empty());
        self
    }

    pub fn with_measurement(mut self, measurement: Option<MeasuredValue>) -> Self {
        self.measurement = measurement;
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.modified_at = created_at;
        self
    }

    /// Check every invariant a record must hold.
    ///
    /// Records deserialized from storage or imports bypass the constructor,
    /// so callers must validate them before use.
    pub fn validate(&self) -> RecordResult<()> {
        let expected = self.kind.shape();
        let found = self.geometry.shape();
        if expected != found {
            return Err(RecordError::ShapeMismatch { kind: self.kind, expected, found });
        }
        self.geometry.check_finite()?;
        if self.image_id.trim().is_empty() {
            return Err(RecordError::MissingField("image_id"));
        }
        if self.viewport_id.trim().is_empty() {
            return Err(RecordError::MissingField("viewport_id"));
        }
        Ok(())
    }

    pub fn id(&self) -> AnnotationId {
        self.id
    }

    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    pub fn geometry(&self) -> &AnnotationGeometry {
        &self.geometry
    }

    pub fn measurement(&self) -> Option<&MeasuredValue> {
        self.measurement.as_ref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn viewport_id(&self) -> &str {
        &self.viewport_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    /// Create a modified copy with new geometry (preserves ID and creation time).
    ///
    /// The new geometry must have the same shape as the old one.
    pub fn with_geometry(
        &self,
        geometry: AnnotationGeometry,
        measurement: Option<MeasuredValue>,
    ) -> RecordResult<Self> {
        if geometry.shape() != self.geometry.shape() {
            return Err(RecordError::ShapeMismatch {
                kind: self.kind,
                expected: self.geometry.shape(),
                found: geometry.shape(),
            });
        }
        geometry.check_finite()?;

        let mut modified = self.clone();
        modified.geometry = geometry;
        modified.measurement = measurement;
        modified.touch();
        Ok(modified)
    }

    /// Update the label in place
    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label.filter(|l| !l.is_empty());
        self.touch();
    }

    fn touch(&mut self) {
        self.modified_at = Utc::now().max(self.created_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f64, y: f64) -> ImagePoint {
        ImagePoint::new(x, y)
    }

    #[test]
    fn test_point_distance() {
        assert!((p(0.0, 0.0).distance_to(&p(3.0, 4.0)) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_tool_kind_round_trips_through_str() {
        for kind in ToolKind::ALL {
            assert_eq!(kind.as_str().parse::<ToolKind>().unwrap(), kind);
        }
        assert!("polygon".parse::<ToolKind>().is_err());
    }

    #[test]
    fn test_tool_kind_serde_names() {
        let json = serde_json::to_string(&ToolKind::EllipticalArea).unwrap();
        assert_eq!(json, "\"elliptical-area\"");
    }

    #[test]
    fn test_measurement_group() {
        assert!(ToolKind::Length.is_measurement());
        assert!(ToolKind::RectangularArea.is_measurement());
        assert!(!ToolKind::Text.is_measurement());
        assert!(!ToolKind::Arrow.is_measurement());
    }

    #[test]
    fn test_geometry_from_points_enforces_count() {
        let err = AnnotationGeometry::from_points(ToolKind::Length, &[p(0.0, 0.0)]).unwrap_err();
        assert_eq!(err, RecordError::PointCount { kind: ToolKind::Length, expected: 2, found: 1 });

        let angle =
            AnnotationGeometry::from_points(ToolKind::Angle, &[p(0.0, 0.0), p(1.0, 0.0), p(0.0, 1.0)])
                .unwrap();
        assert_eq!(angle.shape(), GeometryShape::Angle);
    }

    #[test]
    fn test_region_from_corners_is_normalized() {
        let geometry =
            AnnotationGeometry::from_points(ToolKind::RectangularArea, &[p(10.0, 8.0), p(6.0, 5.0)])
                .unwrap();
        assert_eq!(geometry, AnnotationGeometry::Region { bounds: Bounds::new(6.0, 5.0, 4.0, 3.0) });
        assert_eq!(geometry.first_point(), p(6.0, 5.0));
    }

    #[test]
    fn test_non_finite_points_rejected() {
        let err = AnnotationGeometry::from_points(ToolKind::Text, &[p(f64::NAN, 0.0)]).unwrap_err();
        assert_eq!(err, RecordError::NonFiniteCoordinate);
    }

    #[test]
    fn test_record_rejects_wrong_shape() {
        let geometry = AnnotationGeometry::Anchor { position: p(1.0, 1.0) };
        let err = AnnotationRecord::new(ToolKind::Length, geometry, "img", "vp").unwrap_err();
        assert!(matches!(err, RecordError::ShapeMismatch { kind: ToolKind::Length, .. }));
    }

    #[test]
    fn test_record_requires_owner_ids() {
        let geometry = AnnotationGeometry::Anchor { position: p(1.0, 1.0) };
        let err = AnnotationRecord::new(ToolKind::Text, geometry, "", "vp").unwrap_err();
        assert_eq!(err, RecordError::MissingField("image_id"));
    }

    #[test]
    fn test_with_geometry_preserves_identity_and_shape() {
        let record = AnnotationRecord::new(
            ToolKind::Length,
            AnnotationGeometry::Segment { start: p(0.0, 0.0), end: p(1.0, 0.0) },
            "img",
            "vp",
        )
        .unwrap();

        let moved = record
            .with_geometry(AnnotationGeometry::Segment { start: p(0.0, 0.0), end: p(2.0, 0.0) }, None)
            .unwrap();
        assert_eq!(moved.id(), record.id());
        assert_eq!(moved.created_at(), record.created_at());
        assert!(moved.modified_at() >= record.modified_at());

        let reshaped = record.with_geometry(AnnotationGeometry::Anchor { position: p(0.0, 0.0) }, None);
        assert!(reshaped.is_err());
    }

    #[test]
    fn test_deserialized_record_can_be_validated() {
        let record = AnnotationRecord::new(
            ToolKind::Arrow,
            AnnotationGeometry::Segment { start: p(0.0, 0.0), end: p(5.0, 5.0) },
            "img",
            "vp",
        )
        .unwrap()
        .with_label(Some("lesion".into()));

        let mut value = serde_json::to_value(&record).unwrap();
        let restored: AnnotationRecord = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(restored, record);
        assert!(restored.validate().is_ok());

        value["kind"] = serde_json::json!("angle");
        let tampered: AnnotationRecord = serde_json::from_value(value).unwrap();
        assert!(tampered.validate().is_err());
    }

    #[test]
    fn test_empty_label_is_dropped() {
        let record = AnnotationRecord::new(
            ToolKind::Text,
            AnnotationGeometry::Anchor { position: p(0.0, 0.0) },
            "img",
            "vp",
        )
        .unwrap()
        .with_label(Some(String::new()));
        assert_eq!(record.label(), None);
    }
}
