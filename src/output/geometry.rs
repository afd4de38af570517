//! Center-crop geometry, cached per input shape

use serde::{Deserialize, Serialize};

/// Aspect ratios closer than this are treated as equal
pub const ASPECT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropGeometry {
    pub x_offset: u32,
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
    pub needs_crop: bool,
}

impl CropGeometry {
    /// Center-crop `input` to the aspect ratio of `target`, keeping the full
    /// extent of the other axis.
    pub fn compute(input: (u32, u32), target: (u32, u32)) -> Self {
        let (in_w, in_h) = input;
        let (t_w, t_h) = target;
        let full = Self {
            x_offset: 0,
            y_offset: 0,
            width: in_w,
            height: in_h,
            needs_crop: false,
        };
        if in_w == 0 || in_h == 0 || t_w == 0 || t_h == 0 {
            return full;
        }

        let target = t_w as f64 / t_h as f64;
        let current = in_w as f64 / in_h as f64;
        if (current - target).abs() < ASPECT_TOLERANCE {
            return full;
        }

        if current < target {
            // too tall: trim top and bottom
            let new_h = ((in_w as f64 / target).round() as u32).clamp(1, in_h);
            Self {
                x_offset: 0,
                y_offset: (in_h - new_h) / 2,
                width: in_w,
                height: new_h,
                needs_crop: true,
            }
        } else {
            // too wide: trim left and right
            let new_w = ((in_h as f64 * target).round() as u32).clamp(1, in_w);
            Self {
                x_offset: (in_w - new_w) / 2,
                y_offset: 0,
                width: new_w,
                height: in_h,
                needs_crop: true,
            }
        }
    }
}

/// Crop geometry keyed on the last seen (height, width). Recomputed only when
/// the input shape changes.
#[derive(Debug, Default)]
pub struct CropCache {
    shape: Option<(u32, u32)>,
    geometry: Option<CropGeometry>,
    recomputes: u64,
}

impl CropCache {
    pub fn get(&mut self, shape: (u32, u32), target: (u32, u32)) -> CropGeometry {
        match (self.shape, self.geometry) {
            (Some(cached), Some(geometry)) if cached == shape => geometry,
            _ => {
                let (height, width) = shape;
                let geometry = CropGeometry::compute((width, height), target);
                self.shape = Some(shape);
                self.geometry = Some(geometry);
                self.recomputes += 1;
                geometry
            }
        }
    }

    pub fn clear(&mut self) {
        self.shape = None;
        self.geometry = None;
    }

    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_aspect_needs_no_crop() {
        let g = CropGeometry::compute((1920, 1080), (1280, 720));
        assert!(!g.needs_crop);
        assert_eq!((g.width, g.height), (1920, 1080));
    }

    #[test]
    fn portrait_into_landscape_crops_vertically() {
        let g = CropGeometry::compute((1080, 1920), (1280, 720));
        assert!(g.needs_crop);
        assert_eq!(g.width, 1080);
        assert_eq!(g.height, 608);
        assert_eq!(g.y_offset, 656);
        assert_eq!(g.x_offset, 0);
    }

    #[test]
    fn ultrawide_crops_horizontally_about_center() {
        let g = CropGeometry::compute((2560, 1080), (1280, 720));
        assert!(g.needs_crop);
        assert_eq!(g.height, 1080);
        assert_eq!(g.width, 1920);
        assert_eq!(g.x_offset, 320);
        assert_eq!(g.y_offset, 0);
    }

    #[test]
    fn near_equal_aspect_is_tolerated() {
        // 1366x768 is 1.7786, 16:9 is 1.7778
        assert!(!CropGeometry::compute((1366, 768), (1280, 720)).needs_crop);
    }

    #[test]
    fn cache_recomputes_only_on_shape_change() {
        let mut cache = CropCache::default();
        let target = (1280, 720);
        for _ in 0..10 {
            cache.get((1920, 1080), target);
        }
        assert_eq!(cache.recomputes(), 1);
        let g = cache.get((1080, 1920), target);
        assert_eq!(g.height, 1080);
        assert_eq!(cache.recomputes(), 2);
        cache.clear();
        cache.get((1080, 1920), target);
        assert_eq!(cache.recomputes(), 3);
    }
}
