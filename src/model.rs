use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Default number of records per chunk in the point-layout time index.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Stable feature identifier as supplied by the host layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    Int(i64),
    Text(String),
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Int(v) => write!(f, "{}", v),
            FeatureId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for FeatureId {
    fn from(v: i64) -> Self {
        FeatureId::Int(v)
    }
}

impl From<&str> for FeatureId {
    fn from(s: &str) -> Self {
        FeatureId::Text(s.to_string())
    }
}

/// A raw attribute value as handed over by the host feature stream.
///
/// Time classification inspects one sample of this shape; every later value
/// of the same field is assumed to share it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Number(f64),
    Text(String),
    /// Host-native timestamp, no zone attached. Treated as UTC.
    DateTime(NaiveDateTime),
    /// Host-native calendar date. Midnight UTC implied.
    Date(NaiveDate),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

/// One feature pulled from the host stream: identity, named attributes and
/// an optional geometry. The stream is finite and never re-read.
#[derive(Debug, Clone)]
pub struct RawFeature {
    pub id: FeatureId,
    pub geometry: Option<Geometry>,
    pub attributes: HashMap<String, RawValue>,
}

impl RawFeature {
    pub fn attribute(&self, name: &str) -> Option<&RawValue> {
        self.attributes.get(name)
    }
}

/// Map coordinate in the layer's CRS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned extent accumulated from coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn from_coord(c: Coord) -> Self {
        Self { min_x: c.x, min_y: c.y, max_x: c.x, max_y: c.y }
    }

    pub fn expand(&mut self, c: Coord) {
        self.min_x = self.min_x.min(c.x);
        self.min_y = self.min_y.min(c.y);
        self.max_x = self.max_x.max(c.x);
        self.max_y = self.max_y.max(c.y);
    }

    pub fn center(&self) -> Coord {
        Coord::new((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }
}

/// Coordinate reprojection supplied by the host when the layer CRS differs
/// from the map CRS.
pub trait CoordTransform {
    fn apply(&self, c: Coord) -> Coord;
}

impl<F> CoordTransform for F
where
    F: Fn(Coord) -> Coord,
{
    fn apply(&self, c: Coord) -> Coord {
        self(c)
    }
}

/// Feature geometry, one variant per supported kind. Each variant carries
/// only what that kind needs; rendering happens outside this crate.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    Line(Vec<Coord>),
    /// Outer ring first, holes after.
    Polygon(Vec<Vec<Coord>>),
}

impl Geometry {
    /// Flat view of every vertex, used for extent computation.
    pub fn points(&self) -> Vec<Coord> {
        match self {
            Geometry::Point(c) => vec![*c],
            Geometry::Line(coords) => coords.clone(),
            Geometry::Polygon(rings) => rings.iter().flatten().copied().collect(),
        }
    }

    /// Reproject every vertex in place.
    pub fn transform(&mut self, xform: &dyn CoordTransform) {
        match self {
            Geometry::Point(c) => *c = xform.apply(*c),
            Geometry::Line(coords) => {
                for c in coords.iter_mut() {
                    *c = xform.apply(*c);
                }
            }
            Geometry::Polygon(rings) => {
                for ring in rings.iter_mut() {
                    for c in ring.iter_mut() {
                        *c = xform.apply(*c);
                    }
                }
            }
        }
    }

    pub fn envelope(&self) -> Option<Rect> {
        let pts = self.points();
        let mut iter = pts.into_iter();
        let first = iter.next()?;
        let mut rect = Rect::from_coord(first);
        for c in iter {
            rect.expand(c);
        }
        Some(rect)
    }
}

/// One feature's temporal projection: what the index sorts, chunks and
/// serves back to the animation clock.
///
/// Immutable after ingest except for `marker_index`, which is rewritten when
/// the host's symbol table changes.
#[derive(Debug, Clone)]
pub struct TimeRecord {
    pub id: FeatureId,
    /// Seconds since the Unix epoch, the canonical internal unit.
    pub epoch: f64,
    /// Present only on duration records. Always >= `epoch`.
    pub end_epoch: Option<f64>,
    /// Index into the host-owned symbol table. Opaque here.
    pub marker_index: usize,
    /// Optional display label resolved at ingest. Opaque here.
    pub label: Option<String>,
    pub geometry: Geometry,
}
