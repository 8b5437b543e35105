//! Integer square roots and annulus mask tables.
//!
//! The mask is built once per search and shared read-only by every worker:
//! for each row offset it records which horizontal offsets fall between the
//! inner and outer circles. Workers only ever walk these width tables; no
//! per-cell distance math happens in the scan loops.

/// floor(sqrt(n)) for small n, indexed directly. Covers every radius the
/// mask builder meets in practice; larger inputs fall back to Newton
/// iteration.
const ISQRT_LUT: [i32; 72] = [
    0, 1, 1, 1, 2, 2, 2, 2, //
    2, 3, 3, 3, 3, 3, 3, 3, //
    4, 4, 4, 4, 4, 4, 4, 4, //
    4, 5, 5, 5, 5, 5, 5, 5, //
    5, 5, 5, 5, 6, 6, 6, 6, //
    6, 6, 6, 6, 6, 6, 6, 6, //
    6, 7, 7, 7, 7, 7, 7, 7, //
    7, 7, 7, 7, 7, 7, 7, 7, //
    8, 8, 8, 8, 8, 8, 8, 8,
];

/// floor(sqrt(n)) for n >= 0.
///
/// Satisfies `isqrt(n)^2 <= n < (isqrt(n) + 1)^2` for every non-negative
/// input.
pub fn isqrt(n: i32) -> i32 {
    debug_assert!(n >= 0, "isqrt of negative input {n}");
    if let Some(&root) = ISQRT_LUT.get(n as usize) {
        return root;
    }

    // Newton's method, seeded from the bit length so the first guess is
    // within a factor of two of the root. The bracket check runs in 64 bits
    // since (root + 1)^2 can exceed i32 for inputs near i32::MAX.
    let wide = n as i64;
    let mut x = 1i64 << ((31 - n.leading_zeros()) / 2);
    loop {
        x = (x + wide / x) / 2;
        if x * x <= wide && (x + 1) * (x + 1) > wide {
            return x as i32;
        }
    }
}

/// Horizontal extent of the annulus on one row: offsets `cx` with
/// `inner <= |cx| <= outer` are members. An empty row carries
/// `inner > outer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub inner: i32,
    pub outer: i32,
}

impl RowSpan {
    const EMPTY: RowSpan = RowSpan { inner: 1, outer: 0 };

    pub fn is_empty(&self) -> bool {
        self.inner > self.outer
    }
}

/// Annulus membership table between an inner and an outer radius.
///
/// Row `cz` (relative to the center cell) admits the offsets of its
/// [`RowSpan`]. The outer boundary is included and so is the inner one:
/// membership follows the discretized widths `outer = isqrt(or^2 - cz^2)`
/// and `inner = isqrt(ir^2 - cz^2)` (0 where the row clears the inner
/// circle), not the exact real-valued annulus. An inner radius larger than
/// the outer radius degrades to a mask with no member cells.
#[derive(Debug, Clone)]
pub struct AnnulusMask {
    outer_radius: i32,
    inner_radius: i32,
    rows: Vec<RowSpan>,
}

impl AnnulusMask {
    pub fn new(outer_radius: i32, inner_radius: i32) -> Self {
        debug_assert!(outer_radius >= 0 && inner_radius >= 0);
        let side = (2 * outer_radius + 1) as usize;
        let mut rows = Vec::with_capacity(side);
        let degenerate = inner_radius > outer_radius;
        for cz in -outer_radius..=outer_radius {
            if degenerate {
                rows.push(RowSpan::EMPTY);
                continue;
            }
            let cz2 = cz * cz;
            let outer = isqrt(outer_radius * outer_radius - cz2);
            let inner = if inner_radius * inner_radius < cz2 {
                0
            } else {
                isqrt(inner_radius * inner_radius - cz2)
            };
            rows.push(RowSpan { inner, outer });
        }
        AnnulusMask {
            outer_radius,
            inner_radius,
            rows,
        }
    }

    pub fn outer_radius(&self) -> i32 {
        self.outer_radius
    }

    pub fn inner_radius(&self) -> i32 {
        self.inner_radius
    }

    /// Side length of the bounding box, `2 * outer_radius + 1`.
    pub fn side(&self) -> i32 {
        2 * self.outer_radius + 1
    }

    /// Width span for row offset `cz` in `[-outer_radius, outer_radius]`.
    pub fn row(&self, cz: i32) -> RowSpan {
        self.rows[(cz + self.outer_radius) as usize]
    }

    /// Whether the offset `(cx, cz)` lies inside the annulus.
    pub fn contains(&self, cx: i32, cz: i32) -> bool {
        if cz.abs() > self.outer_radius {
            return false;
        }
        let span = self.row(cz);
        let cx = cx.abs();
        span.inner <= cx && cx <= span.outer
    }

    /// Number of member cells.
    pub fn cell_count(&self) -> u32 {
        let mut total = 0u32;
        for span in &self.rows {
            if span.is_empty() {
                continue;
            }
            total += (span.outer - span.inner + 1) as u32;
            if span.inner == 0 {
                // Offset 0 has no mirror.
                total += span.outer as u32;
            } else {
                total += (span.outer - span.inner + 1) as u32;
            }
        }
        total
    }

    /// Render the mask as a dense row-major `side * side` grid of 0/1
    /// words, suitable for upload as read-only device memory.
    pub fn as_grid(&self) -> Vec<u32> {
        let side = self.side();
        let mut grid = vec![0u32; (side * side) as usize];
        for cz in -self.outer_radius..=self.outer_radius {
            for cx in -self.outer_radius..=self.outer_radius {
                if self.contains(cx, cz) {
                    let row = (cz + self.outer_radius) * side;
                    grid[(row + cx + self.outer_radius) as usize] = 1;
                }
            }
        }
        grid
    }
}
