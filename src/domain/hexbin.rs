//! Hexagonal grid binning
//!
//! Snaps planar coordinates to the center of the enclosing cell of a
//! pointy-top hexagonal tiling. Rows are `dy` apart and odd rows are shifted
//! right by half a column (`dx / 2`). The construction follows d3-hexbin:
//! round to the nearest row and column, then, if the point sits in the
//! corner band of its row, compare against the diagonal neighbour.
//!
//! Candidates are compared in normalized space, so corner-band boundaries
//! deviate slightly from the true hexagon edges. Rounding is `f64::round`
//! (half away from zero) everywhere.

use crate::domain::error::GeoError;
use crate::domain::types::{Cell, HexIndex};
use std::f64::consts::FRAC_PI_3;

/// Maps coordinates to hexagon centers for a fixed cell radius
///
/// Immutable after construction and `Copy`, so every worker can hold its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HexGridBinner {
    /// Center-to-vertex distance
    radius: f64,
    /// Distance between neighbouring centers in a row
    dx: f64,
    /// Distance between rows
    dy: f64,
}

impl HexGridBinner {
    /// Create a binner for cells of the given radius
    pub fn new(radius: f64) -> Result<Self, GeoError> {
        if !radius.is_finite() {
            return Err(GeoError::invalid("radius", format!("{radius} is not finite")));
        }
        if radius <= 0.0 {
            return Err(GeoError::invalid("radius", format!("{radius} must be positive")));
        }
        Ok(Self { radius, dx: 2.0 * radius * FRAC_PI_3.sin(), dy: 1.5 * radius })
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    pub fn dy(&self) -> f64 {
        self.dy
    }

    /// Center of the cell containing `(x, y)`
    #[inline]
    pub fn bin(&self, x: f64, y: f64) -> Cell {
        self.center(self.locate(x, y))
    }

    /// Grid index of the cell containing `(x, y)`
    #[inline]
    pub fn locate(&self, x: f64, y: f64) -> HexIndex {
        nearest_index(x / self.dx, y / self.dy)
    }

    /// Continuous center of a grid cell
    #[inline]
    pub fn center(&self, index: HexIndex) -> Cell {
        let col = index.col as f64 + stagger(index.row as f64);
        Cell::new(col * self.dx, index.row as f64 * self.dy)
    }
}

/// Half-column offset of a row: 0.5 for odd rows, 0 for even ones.
/// Two's-complement parity, so row -1 is odd.
#[inline]
fn stagger(row: f64) -> f64 {
    if (row as i64) & 1 == 1 {
        0.5
    } else {
        0.0
    }
}

/// Unit step from `from` toward `value`; zero steps forward
#[inline]
fn toward(value: f64, from: f64) -> f64 {
    if value < from {
        -1.0
    } else {
        1.0
    }
}

/// Nearest cell for a point in normalized space (`x / dx`, `y / dy`)
fn nearest_index(nx: f64, py: f64) -> HexIndex {
    let mut pj = py.round();
    let px = nx - stagger(pj);
    let mut pi = px.round();
    let py1 = py - pj;

    if 3.0 * py1.abs() > 1.0 {
        let px1 = px - pi;
        let pi2 = pi + toward(px, pi) / 2.0;
        let pj2 = pj + toward(py, pj);
        let px2 = px - pi2;
        let py2 = py - pj2;

        // Strictly greater: an exact tie keeps the first candidate
        if px1 * px1 + py1 * py1 > px2 * px2 + py2 * py2 {
            pi = pi2 + if stagger(pj) > 0.0 { 0.5 } else { -0.5 };
            pj = pj2;
        }
    }

    HexIndex { col: pi as i64, row: pj as i64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWEET_RADIUS: f64 = 1.0 / 240.0;

    fn distance(a: (f64, f64), b: Cell) -> f64 {
        ((a.0 - b.x).powi(2) + (a.1 - b.y).powi(2)).sqrt()
    }

    /// Deterministic pseudo-random points (64-bit LCG)
    fn sample_points(count: usize, span: f64, base: (f64, f64)) -> Vec<(f64, f64)> {
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        (0..count)
            .map(|_| (base.0 + (next() - 0.5) * span, base.1 + (next() - 0.5) * span))
            .collect()
    }

    #[test]
    fn test_known_tweet_coordinate() {
        let binner = HexGridBinner::new(TWEET_RADIUS).unwrap();
        let cell = binner.bin(-122.40793609, 37.79038645);

        assert!((cell.x - -122.40908238574796).abs() < 1e-5, "x was {}", cell.x);
        assert!((cell.y - 37.793750).abs() < 1e-5, "y was {}", cell.y);
        assert_eq!(binner.locate(-122.40793609, 37.79038645), HexIndex { col: -16962, row: 6047 });
    }

    #[test]
    fn test_spacing() {
        let binner = HexGridBinner::new(1.0).unwrap();
        assert!((binner.dx() - 3.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(binner.dy(), 1.5);
        assert_eq!(binner.radius(), 1.0);
    }

    #[test]
    fn test_rejects_bad_radius() {
        for radius in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = HexGridBinner::new(radius).unwrap_err();
            assert!(
                matches!(err, GeoError::InvalidParameter { name: "radius", .. }),
                "radius {radius} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_deterministic() {
        let binner = HexGridBinner::new(TWEET_RADIUS).unwrap();
        for (x, y) in sample_points(500, 1.0, (-122.4, 37.8)) {
            assert_eq!(binner.bin(x, y), binner.bin(x, y));
        }
    }

    #[test]
    fn test_idempotent_on_centers() {
        let binner = HexGridBinner::new(TWEET_RADIUS).unwrap();
        for (x, y) in sample_points(2000, 2.0, (-122.4, 37.8)) {
            let cell = binner.bin(x, y);
            assert_eq!(binner.bin(cell.x, cell.y), cell, "input ({x}, {y})");
        }
    }

    #[test]
    fn test_result_is_nearest_center_in_normalized_space() {
        let binner = HexGridBinner::new(0.7).unwrap();
        let normalized = |p: (f64, f64), c: Cell| {
            let (u, v) = ((p.0 - c.x) / binner.dx(), (p.1 - c.y) / binner.dy());
            u * u + v * v
        };

        for (x, y) in sample_points(2000, 40.0, (3.0, -5.0)) {
            let index = binner.locate(x, y);
            let chosen = normalized((x, y), binner.center(index));

            for row in index.row - 2..=index.row + 2 {
                for col in index.col - 2..=index.col + 2 {
                    let other = normalized((x, y), binner.center(HexIndex { col, row }));
                    assert!(other >= chosen - 1e-9, "({x}, {y}) closer to ({col}, {row})");
                }
            }
        }
    }

    #[test]
    fn test_center_within_one_cell_width() {
        let binner = HexGridBinner::new(0.7).unwrap();
        for (x, y) in sample_points(2000, 40.0, (3.0, -5.0)) {
            let d = distance((x, y), binner.bin(x, y));
            assert!(d < binner.dx(), "({x}, {y}) is {d} away");
        }
    }

    #[test]
    fn test_small_perturbation_stays_in_cell() {
        let binner = HexGridBinner::new(TWEET_RADIUS).unwrap();
        let cell = binner.bin(-122.40793609, 37.79038645);
        let eps = TWEET_RADIUS * 0.1;
        for (ox, oy) in [(eps, 0.0), (-eps, 0.0), (0.0, eps), (0.0, -eps), (eps, -eps)] {
            assert_eq!(binner.bin(cell.x + ox, cell.y + oy), cell);
        }
    }

    #[test]
    fn test_vertical_edge_between_row_neighbours() {
        let binner = HexGridBinner::new(1.0).unwrap();
        let edge = binner.dx() / 2.0;

        assert_eq!(binner.locate(edge - 1e-9, 0.0), HexIndex { col: 0, row: 0 });
        assert_eq!(binner.locate(edge + 1e-9, 0.0), HexIndex { col: 1, row: 0 });
        assert_eq!(binner.locate(-edge + 1e-9, 0.0), HexIndex { col: 0, row: 0 });
        assert_eq!(binner.locate(-edge - 1e-9, 0.0), HexIndex { col: -1, row: 0 });
    }

    #[test]
    fn test_corner_band_picks_diagonal_neighbour() {
        let binner = HexGridBinner::new(1.0).unwrap();

        // Straight up toward the top vertex stays in the origin cell
        assert_eq!(binner.locate(0.0, 0.9), HexIndex { col: 0, row: 0 });
        // Off to the right of the vertex belongs to the odd row above
        assert_eq!(binner.locate(0.8, 0.9), HexIndex { col: 0, row: 1 });
        let cell = binner.bin(0.8, 0.9);
        assert!((cell.x - binner.dx() / 2.0).abs() < 1e-12);
        assert_eq!(cell.y, 1.5);
    }

    #[test]
    fn test_negative_rows_are_staggered() {
        let binner = HexGridBinner::new(1.0).unwrap();
        let cell = binner.bin(-0.87, -1.49);

        assert_eq!(binner.locate(-0.87, -1.49), HexIndex { col: -1, row: -1 });
        assert!((cell.x - -binner.dx() / 2.0).abs() < 1e-12);
        assert_eq!(cell.y, -1.5);
    }

    #[test]
    fn test_equidistant_point_keeps_first_candidate() {
        // In normalized space (0.375, 0.4375) is exactly as far from (0, 0)
        // as from the half-offset center (0.5, 1) of the row above.
        assert_eq!(nearest_index(0.375, 0.4375), HexIndex { col: 0, row: 0 });
        // Nudged upward it flips to the diagonal cell
        assert_eq!(nearest_index(0.375, 0.44), HexIndex { col: 0, row: 1 });
    }
}
