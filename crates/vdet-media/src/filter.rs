//! Region-of-interest and class allow-list filtering.

use std::collections::HashSet;

use vdet_models::{BoundingBox, Detection, Point, Polygon, RegionMatch};

/// Sample grid side used to estimate how much of a box lies inside regions.
const OVERLAP_GRID: usize = 8;

/// Stateless detection filter for one stream.
///
/// A detection is kept when its class is allowed (an empty allow-list allows
/// every class) and it falls inside at least one region (no regions means the
/// whole frame).
#[derive(Debug, Clone, Default)]
pub struct RegionClassFilter {
    regions: Vec<Polygon>,
    classes: HashSet<String>,
    matching: RegionMatch,
}

impl RegionClassFilter {
    pub fn new<I, S>(regions: Vec<Polygon>, classes: I, matching: RegionMatch) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            regions,
            classes: classes.into_iter().map(Into::into).collect(),
            matching,
        }
    }

    /// Filter that keeps everything.
    pub fn pass_all() -> Self {
        Self::default()
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections.into_iter().filter(|d| self.retains(d)).collect()
    }

    pub fn retains(&self, detection: &Detection) -> bool {
        self.class_allowed(&detection.label) && self.in_regions(&detection.bbox)
    }

    fn class_allowed(&self, label: &str) -> bool {
        self.classes.is_empty() || self.classes.contains(label)
    }

    fn in_regions(&self, bbox: &BoundingBox) -> bool {
        if self.regions.is_empty() {
            return true;
        }

        match self.matching {
            RegionMatch::Centroid => self.inside_any(bbox.center()),
            RegionMatch::Overlap { min_fraction } => self.overlap_fraction(bbox) >= min_fraction,
        }
    }

    fn inside_any(&self, point: Point) -> bool {
        self.regions.iter().any(|region| region.contains(point))
    }

    /// Fraction of grid cell centers within the box that fall inside a region.
    fn overlap_fraction(&self, bbox: &BoundingBox) -> f32 {
        let x0 = f64::from(bbox.x);
        let y0 = f64::from(bbox.y);
        let cell_w = f64::from(bbox.width) / OVERLAP_GRID as f64;
        let cell_h = f64::from(bbox.height) / OVERLAP_GRID as f64;

        let mut inside = 0usize;
        for row in 0..OVERLAP_GRID {
            for col in 0..OVERLAP_GRID {
                let sample = Point::new(
                    x0 + (col as f64 + 0.5) * cell_w,
                    y0 + (row as f64 + 0.5) * cell_h,
                );
                if self.inside_any(sample) {
                    inside += 1;
                }
            }
        }

        inside as f32 / (OVERLAP_GRID * OVERLAP_GRID) as f32
    }
}
