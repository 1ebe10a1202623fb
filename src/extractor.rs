//! Turns raw text extents measured by the worker into normalized
//! interaction elements.

use crate::types::{BoundingBox, ElementKind, InteractionElement};
use serde::{Deserialize, Serialize};

/// Rectangle in display pixels, origin bottom-left, as measured on the
/// drawn canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl PixelRect {
    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    fn is_finite(&self) -> bool {
        self.x0.is_finite() && self.y0.is_finite() && self.x1.is_finite() && self.y1.is_finite()
    }

    fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let rect = PixelRect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        (rect.width() > 0.0 && rect.height() > 0.0).then_some(rect)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredText {
    pub kind: ElementKind,
    pub text: String,
    pub extent: PixelRect,
    #[serde(default)]
    pub axes_index: Option<usize>,
}

/// Measurements the worker reports for the final figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedFigure {
    /// Region of the canvas that ends up in the artifact
    pub canvas: PixelRect,
    #[serde(default)]
    pub texts: Vec<MeasuredText>,
}

/// Normalize every present text element against the canvas. Elements that
/// are blank, degenerate, or fall outside the canvas are omitted.
pub fn extract_elements(figure: &RenderedFigure) -> Vec<InteractionElement> {
    let canvas = figure.canvas;
    if !canvas.is_finite() || canvas.width() <= 0.0 || canvas.height() <= 0.0 {
        return Vec::new();
    }

    figure
        .texts
        .iter()
        .filter_map(|measured| {
            let text = measured.text.trim();
            if text.is_empty() || !measured.extent.is_finite() {
                return None;
            }
            let clipped = measured.extent.intersect(&canvas)?;
            Some(InteractionElement {
                kind: measured.kind,
                text: text.to_string(),
                bbox: normalize(&clipped, &canvas),
                axes_index: measured.axes_index,
            })
        })
        .collect()
}

fn normalize(rect: &PixelRect, canvas: &PixelRect) -> BoundingBox {
    let w = canvas.width();
    let h = canvas.height();
    let x = ((rect.x0 - canvas.x0) / w).clamp(0.0, 1.0);
    let y = ((rect.y0 - canvas.y0) / h).clamp(0.0, 1.0);
    BoundingBox {
        x,
        y,
        width: (rect.width() / w).clamp(0.0, 1.0 - x),
        height: (rect.height() / h).clamp(0.0, 1.0 - y),
    }
}
