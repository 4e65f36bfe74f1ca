//! Conversion between `PersistedRecord` and `CanvasObject`.
//!
//! DESIGN
//! ======
//! The structural columns map one-to-one. Style, content, and kind-specific
//! fields live in the opaque `attributes` blob under camelCase keys. Keys this
//! module does not know are kept in `CanvasObject::extra` and written back
//! untouched, so peers running newer code never lose data through us.
//!
//! A known key with the wrong JSON type is treated as absent and the kind
//! default applies. An unknown `kind` or a non-object blob is malformed and
//! the whole record is rejected.

#[cfg(test)]
#[path = "convert_test.rs"]
mod tests;

use serde_json::{Map, Value};

use super::{CanvasObject, PersistedRecord, ShapeKind, defaults};

// =============================================================================
// ATTRIBUTE KEYS
// =============================================================================

pub const ATTR_FILL: &str = "fill";
pub const ATTR_STROKE: &str = "stroke";
pub const ATTR_STROKE_WIDTH: &str = "strokeWidth";
pub const ATTR_OPACITY: &str = "opacity";
pub const ATTR_TEXT: &str = "text";
pub const ATTR_FONT_FAMILY: &str = "fontFamily";
pub const ATTR_ROTATION: &str = "rotation";
pub const ATTR_POINTS: &str = "points";
pub const ATTR_FROM_ID: &str = "fromId";
pub const ATTR_TO_ID: &str = "toId";
pub const ATTR_CONNECTOR_STYLE: &str = "connectorStyle";

const KNOWN_ATTRS: [&str; 11] = [
    ATTR_FILL,
    ATTR_STROKE,
    ATTR_STROKE_WIDTH,
    ATTR_OPACITY,
    ATTR_TEXT,
    ATTR_FONT_FAMILY,
    ATTR_ROTATION,
    ATTR_POINTS,
    ATTR_FROM_ID,
    ATTR_TO_ID,
    ATTR_CONNECTOR_STYLE,
];

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    #[error("unknown object kind: {0}")]
    UnknownKind(String),
    #[error("attributes for object {0} are not a JSON object")]
    MalformedAttributes(String),
}

// =============================================================================
// RECORD -> OBJECT
// =============================================================================

/// Unpack a durable row into a canvas object, filling kind defaults.
///
/// # Errors
///
/// Returns `UnknownKind` for a kind outside the closed set and
/// `MalformedAttributes` when the blob is neither an object nor null.
pub fn record_to_object(record: &PersistedRecord) -> Result<CanvasObject, ObjectError> {
    let kind: ShapeKind = record.kind.parse()?;
    let empty = Map::new();
    let attrs = match &record.attributes {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(ObjectError::MalformedAttributes(record.id.clone())),
    };
    let d = defaults::shape_default(kind);

    let extra: Map<String, Value> = attrs
        .iter()
        .filter(|(k, _)| !KNOWN_ATTRS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(CanvasObject {
        id: record.id.clone(),
        kind,
        x: record.x,
        y: record.y,
        width: record.width,
        height: record.height,
        rotation: attr_f64(attrs, ATTR_ROTATION),
        fill: attr_string(attrs, ATTR_FILL).unwrap_or_else(|| d.fill.to_owned()),
        stroke: attr_string(attrs, ATTR_STROKE).or_else(|| d.stroke.map(str::to_owned)),
        stroke_width: attr_f64(attrs, ATTR_STROKE_WIDTH).unwrap_or(d.stroke_width),
        opacity: attr_f64(attrs, ATTR_OPACITY).unwrap_or(defaults::DEFAULT_OPACITY),
        text: attr_string(attrs, ATTR_TEXT),
        font_family: attr_string(attrs, ATTR_FONT_FAMILY),
        points: attr_points(attrs),
        from_id: attr_string(attrs, ATTR_FROM_ID),
        to_id: attr_string(attrs, ATTR_TO_ID),
        connector_style: attr_string(attrs, ATTR_CONNECTOR_STYLE),
        stack_order: record.stack_order,
        last_modified: record.last_modified.clone(),
        extra,
    })
}

fn attr_string(attrs: &Map<String, Value>, key: &str) -> Option<String> {
    attrs.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn attr_f64(attrs: &Map<String, Value>, key: &str) -> Option<f64> {
    attrs.get(key).and_then(Value::as_f64)
}

fn attr_points(attrs: &Map<String, Value>) -> Option<Vec<f64>> {
    let list = attrs.get(ATTR_POINTS)?.as_array()?;
    list.iter().map(Value::as_f64).collect()
}

// =============================================================================
// OBJECT -> RECORD
// =============================================================================

/// Pack a canvas object into a durable row for `board_id`.
#[must_use]
pub fn object_to_record(obj: &CanvasObject, board_id: &str, creator_id: Option<&str>) -> PersistedRecord {
    PersistedRecord {
        id: obj.id.clone(),
        board_id: board_id.to_owned(),
        kind: obj.kind.as_str().to_owned(),
        attributes: Value::Object(object_attributes(obj)),
        x: obj.x,
        y: obj.y,
        width: obj.width,
        height: obj.height,
        stack_order: obj.stack_order,
        creator_id: creator_id.map(str::to_owned),
        last_modified: obj.last_modified.clone(),
    }
}

/// Build the attribute blob: pass-through keys first, then known keys on top.
fn object_attributes(obj: &CanvasObject) -> Map<String, Value> {
    let mut attrs = obj.extra.clone();
    attrs.insert(ATTR_FILL.into(), Value::from(obj.fill.clone()));
    attrs.insert(ATTR_STROKE_WIDTH.into(), Value::from(obj.stroke_width));
    attrs.insert(ATTR_OPACITY.into(), Value::from(obj.opacity));

    let optional: [(&str, Option<Value>); 8] = [
        (ATTR_STROKE, obj.stroke.clone().map(Value::from)),
        (ATTR_TEXT, obj.text.clone().map(Value::from)),
        (ATTR_FONT_FAMILY, obj.font_family.clone().map(Value::from)),
        (ATTR_ROTATION, obj.rotation.map(Value::from)),
        (ATTR_POINTS, obj.points.clone().map(Value::from)),
        (ATTR_FROM_ID, obj.from_id.clone().map(Value::from)),
        (ATTR_TO_ID, obj.to_id.clone().map(Value::from)),
        (ATTR_CONNECTOR_STYLE, obj.connector_style.clone().map(Value::from)),
    ];
    for (key, value) in optional {
        match value {
            Some(v) => {
                attrs.insert(key.into(), v);
            }
            None => {
                attrs.remove(key);
            }
        }
    }
    attrs
}
