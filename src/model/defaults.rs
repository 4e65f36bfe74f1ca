//! Per-kind default geometry and style, applied when an attribute blob omits a key.

use super::ShapeKind;

pub const DEFAULT_OPACITY: f64 = 1.0;

/// Default size and style for one shape kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeDefault {
    pub width: f64,
    pub height: f64,
    pub fill: &'static str,
    pub stroke: Option<&'static str>,
    pub stroke_width: f64,
}

const fn shape(width: f64, height: f64, fill: &'static str, stroke: &'static str, stroke_width: f64) -> ShapeDefault {
    ShapeDefault { width, height, fill, stroke: Some(stroke), stroke_width }
}

#[must_use]
pub fn shape_default(kind: ShapeKind) -> ShapeDefault {
    match kind {
        ShapeKind::StickyNote => ShapeDefault {
            width: 150.0,
            height: 150.0,
            fill: "#EAB308",
            stroke: None,
            stroke_width: 0.0,
        },
        ShapeKind::Rectangle => shape(120.0, 80.0, "#0066FF", "#0044CC", 1.0),
        ShapeKind::RoundedRectangle => shape(120.0, 80.0, "#7C3AED", "#6D28D9", 1.0),
        ShapeKind::Circle => shape(100.0, 100.0, "#F97316", "#EA580C", 1.0),
        ShapeKind::Ellipse => shape(140.0, 90.0, "#059669", "#047857", 1.0),
        ShapeKind::Triangle => shape(120.0, 100.0, "#0D9488", "#0F766E", 1.0),
        ShapeKind::Diamond => shape(100.0, 120.0, "#EAB308", "#CA8A04", 1.0),
        ShapeKind::Star => shape(120.0, 120.0, "#EC4899", "#DB2777", 1.0),
        ShapeKind::Hexagon => shape(110.0, 100.0, "#7C3AED", "#6D28D9", 1.0),
        ShapeKind::Pentagon => shape(110.0, 100.0, "#EC4899", "#DB2777", 1.0),
        ShapeKind::Arrow => shape(150.0, 4.0, "#1f2937", "#1f2937", 2.0),
        ShapeKind::Line => shape(150.0, 0.0, "transparent", "#1f2937", 2.0),
        ShapeKind::Freedraw => shape(0.0, 0.0, "transparent", "#1f2937", 3.0),
        ShapeKind::Connector => shape(0.0, 0.0, "transparent", "#1f2937", 2.0),
        ShapeKind::Text => ShapeDefault {
            width: 200.0,
            height: 40.0,
            fill: "#1f2937",
            stroke: None,
            stroke_width: 0.0,
        },
    }
}
