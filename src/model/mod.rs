//! Shared object model: canvas objects, persisted records, and sparse patches.
//!
//! This module defines what lives on a board (`CanvasObject`, `ShapeKind`),
//! the board-scoped durable row it is packed into (`PersistedRecord`), and the
//! partial-field update type used by mutations and undo (`ObjectPatch`).
//!
//! Everything here is pure data plus pure functions. Conversion between the two
//! representations lives in `convert`, per-kind defaults in `defaults`, and the
//! last-write-wins decision in `merge`.

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

pub mod convert;
pub mod defaults;
pub mod merge;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Timestamp;

pub use convert::{ObjectError, object_to_record, record_to_object};
pub use merge::{MergeOutcome, should_replace};

/// Unique identifier for a canvas object. Opaque on the wire.
pub type ObjectId = String;

// =============================================================================
// SHAPE KIND
// =============================================================================

/// The closed set of object variants a board can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    StickyNote,
    Rectangle,
    RoundedRectangle,
    Circle,
    Ellipse,
    Triangle,
    Diamond,
    Star,
    Hexagon,
    Pentagon,
    Arrow,
    Line,
    /// Freehand stroke; geometry lives in `CanvasObject::points`.
    Freedraw,
    /// Edge between two objects referenced by id.
    Connector,
    Text,
}

impl ShapeKind {
    pub const ALL: [ShapeKind; 15] = [
        ShapeKind::StickyNote,
        ShapeKind::Rectangle,
        ShapeKind::RoundedRectangle,
        ShapeKind::Circle,
        ShapeKind::Ellipse,
        ShapeKind::Triangle,
        ShapeKind::Diamond,
        ShapeKind::Star,
        ShapeKind::Hexagon,
        ShapeKind::Pentagon,
        ShapeKind::Arrow,
        ShapeKind::Line,
        ShapeKind::Freedraw,
        ShapeKind::Connector,
        ShapeKind::Text,
    ];

    /// Wire name, as stored in `PersistedRecord::kind`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StickyNote => "sticky_note",
            Self::Rectangle => "rectangle",
            Self::RoundedRectangle => "rounded_rectangle",
            Self::Circle => "circle",
            Self::Ellipse => "ellipse",
            Self::Triangle => "triangle",
            Self::Diamond => "diamond",
            Self::Star => "star",
            Self::Hexagon => "hexagon",
            Self::Pentagon => "pentagon",
            Self::Arrow => "arrow",
            Self::Line => "line",
            Self::Freedraw => "freedraw",
            Self::Connector => "connector",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShapeKind {
    type Err = ObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ObjectError::UnknownKind(s.to_owned()))
    }
}

// =============================================================================
// CANVAS OBJECT
// =============================================================================

/// A point in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A board object as held in the local, client-authoritative map.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasObject {
    /// Immutable for the object's lifetime.
    pub id: ObjectId,
    pub kind: ShapeKind,
    /// Left edge of the bounding box.
    pub x: f64,
    /// Top edge of the bounding box.
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Clockwise rotation in degrees, if any.
    pub rotation: Option<f64>,
    pub fill: String,
    pub stroke: Option<String>,
    pub stroke_width: f64,
    pub opacity: f64,
    pub text: Option<String>,
    pub font_family: Option<String>,
    /// Freehand only: flat `[x0, y0, x1, y1, ...]`, relative to `(x, y)`.
    pub points: Option<Vec<f64>>,
    /// Connector only: weak reference to the source object.
    pub from_id: Option<ObjectId>,
    /// Connector only: weak reference to the target object.
    pub to_id: Option<ObjectId>,
    pub connector_style: Option<String>,
    /// Back-to-front draw order; ties fall back to insertion order.
    pub stack_order: i64,
    /// Sole conflict-resolution key.
    pub last_modified: Timestamp,
    /// Attribute keys this engine does not interpret, carried through verbatim.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CanvasObject {
    /// A default-sized, default-styled object of `kind` at `(x, y)` with a fresh id.
    ///
    /// `stack_order` and `last_modified` are placeholders; the channel manager
    /// stamps `last_modified` on create, and callers normally set `stack_order`
    /// from `ObjectStore::next_stack_order`.
    #[must_use]
    pub fn new(kind: ShapeKind, x: f64, y: f64) -> Self {
        let d = defaults::shape_default(kind);
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            x,
            y,
            width: d.width,
            height: d.height,
            rotation: None,
            fill: d.fill.to_owned(),
            stroke: d.stroke.map(str::to_owned),
            stroke_width: d.stroke_width,
            opacity: defaults::DEFAULT_OPACITY,
            text: None,
            font_family: None,
            points: None,
            from_id: None,
            to_id: None,
            connector_style: None,
            stack_order: 0,
            last_modified: Timestamp::default(),
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<ObjectId>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_stack_order(mut self, stack_order: i64) -> Self {
        self.stack_order = stack_order;
        self
    }

    /// Build a connector between two objects.
    #[must_use]
    pub fn connector(from_id: impl Into<ObjectId>, to_id: impl Into<ObjectId>) -> Self {
        let mut obj = Self::new(ShapeKind::Connector, 0.0, 0.0);
        obj.from_id = Some(from_id.into());
        obj.to_id = Some(to_id.into());
        obj
    }
}

// =============================================================================
// PERSISTED RECORD
// =============================================================================

/// The board-scoped durable row. `attributes` is opaque to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: ObjectId,
    pub board_id: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub stack_order: i64,
    #[serde(default)]
    pub creator_id: Option<String>,
    pub last_modified: Timestamp,
}

// =============================================================================
// OBJECT PATCH
// =============================================================================

/// Sparse update. `None` leaves a field alone; nullable fields use an inner
/// `Option` so a patch can clear them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub rotation: Option<Option<f64>>,
    pub fill: Option<String>,
    pub stroke: Option<Option<String>>,
    pub stroke_width: Option<f64>,
    pub opacity: Option<f64>,
    pub text: Option<Option<String>>,
    pub font_family: Option<Option<String>>,
    pub points: Option<Option<Vec<f64>>>,
    pub from_id: Option<Option<ObjectId>>,
    pub to_id: Option<Option<ObjectId>>,
    pub connector_style: Option<Option<String>>,
    pub stack_order: Option<i64>,
}

/// Invoke `$m!` with every patchable field name. Each patch field is
/// `Option<T>` where `T` is the type of the same-named `CanvasObject` field.
macro_rules! with_patch_fields {
    ($m:ident) => {
        $m!(
            x,
            y,
            width,
            height,
            rotation,
            fill,
            stroke,
            stroke_width,
            opacity,
            text,
            font_family,
            points,
            from_id,
            to_id,
            connector_style,
            stack_order
        )
    };
}

impl ObjectPatch {
    /// Position-only patch.
    #[must_use]
    pub fn position(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::default() }
    }

    /// True when the patch touches no field.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        macro_rules! all_none {
            ($($f:ident),*) => { $(self.$f.is_none())&&* };
        }
        with_patch_fields!(all_none)
    }

    /// Write every present field onto `obj`. Does not touch `last_modified`.
    pub fn apply_to(&self, obj: &mut CanvasObject) {
        macro_rules! apply {
            ($($f:ident),*) => {
                $(
                    if let Some(v) = &self.$f {
                        obj.$f = v.clone();
                    }
                )*
            };
        }
        with_patch_fields!(apply);
    }

    /// The subset of this patch that would actually change `obj`.
    #[must_use]
    pub fn changes_for(&self, obj: &CanvasObject) -> Self {
        macro_rules! diff {
            ($($f:ident),*) => {
                Self { $($f: self.$f.as_ref().filter(|v| **v != obj.$f).cloned(),)* }
            };
        }
        with_patch_fields!(diff)
    }

    /// `obj`'s current values for exactly the fields this patch touches.
    #[must_use]
    pub fn capture(&self, obj: &CanvasObject) -> Self {
        macro_rules! capture {
            ($($f:ident),*) => {
                Self { $($f: self.$f.as_ref().map(|_| obj.$f.clone()),)* }
            };
        }
        with_patch_fields!(capture)
    }
}
