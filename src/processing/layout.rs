use crate::photo::Dimensions;

/// Aspects closer than this are treated as equal and skip composition.
const ASPECT_TOLERANCE: f64 = 0.01;

/// Smallest size with the source's aspect that fills `canvas` on both axes.
pub fn cover(source: Dimensions, canvas: Dimensions) -> Dimensions {
    scaled(source, scale_for(source, canvas, f64::max))
}

/// Largest size with the source's aspect that fits inside `canvas`.
pub fn contain(source: Dimensions, canvas: Dimensions) -> Dimensions {
    scaled(source, scale_for(source, canvas, f64::min))
}

fn scale_for(source: Dimensions, canvas: Dimensions, pick: fn(f64, f64) -> f64) -> f64 {
    let sx = f64::from(canvas.width.max(1)) / f64::from(source.width.max(1));
    let sy = f64::from(canvas.height.max(1)) / f64::from(source.height.max(1));
    let scale = pick(sx, sy);
    if scale.is_finite() { scale } else { 1.0 }
}

fn scaled(source: Dimensions, scale: f64) -> Dimensions {
    let w = (f64::from(source.width.max(1)) * scale).round().max(1.0);
    let h = (f64::from(source.height.max(1)) * scale).round().max(1.0);
    Dimensions::new(w as u32, h as u32)
}

/// Top-left offset that centres `inner` within `outer`; may be negative
/// when `inner` overhangs.
pub fn center_offset(inner: Dimensions, outer: Dimensions) -> (i64, i64) {
    (
        (i64::from(outer.width) - i64::from(inner.width)) / 2,
        (i64::from(outer.height) - i64::from(inner.height)) / 2,
    )
}

pub fn aspect_matches(a: Dimensions, b: Dimensions) -> bool {
    (a.aspect() - b.aspect()).abs() < ASPECT_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_fills_both_axes() {
        let display = Dimensions::new(1920, 1080);
        let portrait = cover(Dimensions::new(1000, 2000), display);
        assert_eq!(portrait, Dimensions::new(1920, 3840));
        let small = cover(Dimensions::new(100, 50), display);
        assert!(small.width >= 1920 && small.height >= 1080);
    }

    #[test]
    fn contain_fits_inside() {
        let display = Dimensions::new(1920, 1080);
        assert_eq!(contain(Dimensions::new(1000, 2000), display), Dimensions::new(540, 1080));
        assert_eq!(contain(Dimensions::new(4000, 1000), display), Dimensions::new(1920, 480));
    }

    #[test]
    fn offsets_center_and_may_go_negative() {
        let outer = Dimensions::new(100, 50);
        assert_eq!(center_offset(Dimensions::new(40, 50), outer), (30, 0));
        assert_eq!(center_offset(Dimensions::new(200, 50), outer), (-50, 0));
    }

    #[test]
    fn aspect_comparison_is_tolerant() {
        assert!(aspect_matches(Dimensions::new(1920, 1080), Dimensions::new(1280, 720)));
        assert!(aspect_matches(Dimensions::new(1921, 1080), Dimensions::new(1920, 1080)));
        assert!(!aspect_matches(Dimensions::new(1080, 1920), Dimensions::new(1920, 1080)));
    }
}
