//! Dirty-rectangle vertex generation
//!
//! The conversion pass draws plain triangles in clip space; each dirty
//! rectangle becomes one quad (two triangles), or two quads for the
//! tile-packed 4:2:0 layout whose chroma rows live below the luma plane.
//! An empty rectangle list falls back to one full-screen quad.

use super::Rect;

/// Floats per vertex (x, y).
pub const FLOATS_PER_VERTEX: usize = 2;

/// One full-screen quad.
pub fn full_screen() -> (Vec<f32>, i32) {
    let vertices = vec![
        -1.0, 1.0, //
        -1.0, -1.0, //
        1.0, 1.0, //
        -1.0, -1.0, //
        1.0, 1.0, //
        1.0, -1.0,
    ];
    (vertices, 6)
}

/// Quads for the packed single-plane layouts (4:2:2 packed word and 4:4:4).
///
/// The 4:2:2 shader folds the horizontal halving itself; clip-space
/// coordinates stay in monitor units for both layouts.
pub fn packed_quads(crects: &[Rect], width: u16, height: u16) -> (Vec<f32>, i32) {
    if crects.is_empty() {
        return full_screen();
    }
    let fw = width as f32 / 2.0;
    let fh = height as f32 / 2.0;
    let mut vertices = Vec::with_capacity(crects.len() * 12);
    for crect in crects {
        let x1 = crect.x as f32 / fw - 1.0;
        let y1 = crect.y as f32 / fh - 1.0;
        let x2 = (crect.x + crect.w) as f32 / fw - 1.0;
        let y2 = (crect.y + crect.h) as f32 / fh - 1.0;
        vertices.extend_from_slice(&[
            x1, y1, //
            x1, y2, //
            x2, y1, //
            x1, y2, //
            x2, y1, //
            x2, y2,
        ]);
    }
    (vertices, crects.len() as i32 * 6)
}

/// Quad pairs for the tile-packed 4:2:0 layout.
///
/// The render target is W x 3H/2: the luma quad lands in the top two thirds
/// (y scaled by 2/3), the chroma quad in the bottom third
/// (y scaled by 1/3 and shifted by 4/3).
pub fn yuv420_quads(crects: &[Rect], width: u16, height: u16) -> (Vec<f32>, i32) {
    if crects.is_empty() {
        return full_screen();
    }
    const FAC13: f32 = 1.0 / 3.0;
    const FAC23: f32 = 2.0 / 3.0;
    const FAC43: f32 = 4.0 / 3.0;

    let fw = width as f32 / 2.0;
    let fh = height as f32 / 2.0;
    let mut vertices = Vec::with_capacity(crects.len() * 24);
    for crect in crects {
        let x1 = crect.x as f32 / fw - 1.0;
        let x2 = (crect.x + crect.w) as f32 / fw - 1.0;
        let y1 = crect.y as f32 / fh;
        let y2 = (crect.y + crect.h) as f32 / fh;

        // y box
        let ly1 = y1 * FAC23 - 1.0;
        let ly2 = y2 * FAC23 - 1.0;
        vertices.extend_from_slice(&[
            x1, ly1, //
            x1, ly2, //
            x2, ly1, //
            x1, ly2, //
            x2, ly1, //
            x2, ly2,
        ]);
        // uv box
        let cy1 = y1 * FAC13 + FAC43 - 1.0;
        let cy2 = y2 * FAC13 + FAC43 - 1.0;
        vertices.extend_from_slice(&[
            x1, cy1, //
            x1, cy2, //
            x2, cy1, //
            x1, cy2, //
            x2, cy1, //
            x2, cy2,
        ]);
    }
    (vertices, crects.len() as i32 * 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_clip_space(vertices: &[f32]) {
        for v in vertices {
            assert!((-1.0..=1.0).contains(v), "vertex {v} escapes clip space");
        }
    }

    #[test]
    fn full_screen_is_two_triangles() {
        let (vertices, count) = full_screen();
        assert_eq!(count, 6);
        assert_eq!(vertices.len(), 12);
        assert_clip_space(&vertices);
    }

    #[test]
    fn empty_rect_list_falls_back_to_full_screen() {
        assert_eq!(packed_quads(&[], 1920, 1080), full_screen());
        assert_eq!(yuv420_quads(&[], 1920, 1080), full_screen());
    }

    #[test]
    fn packed_quads_stay_in_bounds() {
        let rects = [
            Rect { x: 0, y: 0, w: 16, h: 16 },
            Rect { x: 1904, y: 1064, w: 16, h: 16 },
            Rect { x: 0, y: 0, w: 1920, h: 1080 },
        ];
        let (vertices, count) = packed_quads(&rects, 1920, 1080);
        assert_eq!(count, 18);
        assert_eq!(vertices.len(), 36);
        assert_clip_space(&vertices);
    }

    #[test]
    fn yuv420_quads_split_luma_and_chroma_bands() {
        let rects = [Rect { x: 0, y: 0, w: 1920, h: 1080 }];
        let (vertices, count) = yuv420_quads(&rects, 1920, 1080);
        assert_eq!(count, 12);
        assert_eq!(vertices.len(), 24);
        assert_clip_space(&vertices);

        // luma quad spans [-1, 1/3], chroma quad [1/3, 1]
        let luma_ys: Vec<f32> = vertices[..12].chunks(2).map(|v| v[1]).collect();
        let chroma_ys: Vec<f32> = vertices[12..].chunks(2).map(|v| v[1]).collect();
        for y in &luma_ys {
            assert!(*y <= 1.0 / 3.0 + 1e-6);
        }
        for y in &chroma_ys {
            assert!(*y >= 1.0 / 3.0 - 1e-6);
        }
    }

    #[test]
    fn small_dirty_rect_maps_proportionally() {
        let rects = [Rect { x: 960, y: 540, w: 16, h: 16 }];
        let (vertices, _) = packed_quads(&rects, 1920, 1080);
        // left edge of the rect is the monitor midpoint
        assert!((vertices[0] - 0.0).abs() < 1e-6);
    }
}
