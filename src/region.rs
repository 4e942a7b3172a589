//! Damage regions in output (physical) coordinates.

use smithay::utils::{Physical, Rectangle};

/// A rectangle in output pixels.
pub type Rect = Rectangle<i32, Physical>;

/// A set of pixels described by disjoint rectangles.
///
/// Rectangles added to a region never overlap the ones already in it, so the area of a region is
/// the sum of the areas of its rectangles. Two regions compare equal if they cover the same
/// pixels, regardless of how those pixels are split into rectangles.
#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    /// Creates an empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a region covering a single rectangle.
    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    /// The disjoint rectangles making up this region.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Number of pixels covered by the region.
    pub fn area(&self) -> i64 {
        self.rects.iter().map(area).sum()
    }

    /// Adds the pixels of `rect` that are not yet part of the region.
    pub fn add_rect(&mut self, rect: Rect) {
        if is_empty_rect(&rect) {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces
                .into_iter()
                .flat_map(|piece| subtract(piece, *existing))
                .collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    /// Adds every pixel of `other` to this region.
    pub fn union(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    /// Returns the part of this region that lies inside `clip`.
    pub fn intersected(&self, clip: Rect) -> Region {
        Region {
            rects: self
                .rects
                .iter()
                .filter_map(|rect| intersect(*rect, clip))
                .collect(),
        }
    }

    /// Whether every pixel of `rect` is part of this region.
    pub fn contains_rect(&self, rect: Rect) -> bool {
        if is_empty_rect(&rect) {
            return true;
        }
        let mut remainder = vec![rect];
        for existing in &self.rects {
            remainder = remainder
                .into_iter()
                .flat_map(|piece| subtract(piece, *existing))
                .collect();
            if remainder.is_empty() {
                return true;
            }
        }
        false
    }

    /// Whether this region covers exactly the pixels of `rect`, nothing more and nothing less.
    pub fn is_rect(&self, rect: Rect) -> bool {
        !is_empty_rect(&rect) && self.area() == area(&rect) && self.contains_rect(rect)
    }

    /// The smallest rectangle containing the whole region.
    pub fn bounding_box(&self) -> Option<Rect> {
        let first = self.rects.first()?;
        let (mut x1, mut y1) = (first.loc.x, first.loc.y);
        let (mut x2, mut y2) = (first.loc.x + first.size.w, first.loc.y + first.size.h);
        for rect in &self.rects[1..] {
            x1 = x1.min(rect.loc.x);
            y1 = y1.min(rect.loc.y);
            x2 = x2.max(rect.loc.x + rect.size.w);
            y2 = y2.max(rect.loc.y + rect.size.h);
        }
        Some(Rect::from_loc_and_size((x1, y1), (x2 - x1, y2 - y1)))
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area() && self.rects.iter().all(|rect| other.contains_rect(*rect))
    }
}

impl Eq for Region {}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

impl FromIterator<Rect> for Region {
    fn from_iter<T: IntoIterator<Item = Rect>>(iter: T) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.add_rect(rect);
        }
        region
    }
}

impl<'a> IntoIterator for &'a Region {
    type Item = &'a Rect;
    type IntoIter = std::slice::Iter<'a, Rect>;

    fn into_iter(self) -> Self::IntoIter {
        self.rects.iter()
    }
}

fn is_empty_rect(rect: &Rect) -> bool {
    rect.size.w <= 0 || rect.size.h <= 0
}

fn area(rect: &Rect) -> i64 {
    rect.size.w as i64 * rect.size.h as i64
}

fn intersect(a: Rect, b: Rect) -> Option<Rect> {
    let x1 = a.loc.x.max(b.loc.x);
    let y1 = a.loc.y.max(b.loc.y);
    let x2 = (a.loc.x + a.size.w).min(b.loc.x + b.size.w);
    let y2 = (a.loc.y + a.size.h).min(b.loc.y + b.size.h);
    (x2 > x1 && y2 > y1).then(|| Rect::from_loc_and_size((x1, y1), (x2 - x1, y2 - y1)))
}

/// Splits `a` minus `b` into at most four disjoint rectangles.
fn subtract(a: Rect, b: Rect) -> Vec<Rect> {
    let Some(hole) = intersect(a, b) else {
        return vec![a];
    };

    let (ax2, ay2) = (a.loc.x + a.size.w, a.loc.y + a.size.h);
    let (hx2, hy2) = (hole.loc.x + hole.size.w, hole.loc.y + hole.size.h);
    let mut pieces = Vec::with_capacity(4);

    // full-width bands above and below the hole
    if hole.loc.y > a.loc.y {
        pieces.push(Rect::from_loc_and_size(
            (a.loc.x, a.loc.y),
            (a.size.w, hole.loc.y - a.loc.y),
        ));
    }
    if hy2 < ay2 {
        pieces.push(Rect::from_loc_and_size((a.loc.x, hy2), (a.size.w, ay2 - hy2)));
    }
    // left and right of the hole, limited to its rows
    if hole.loc.x > a.loc.x {
        pieces.push(Rect::from_loc_and_size(
            (a.loc.x, hole.loc.y),
            (hole.loc.x - a.loc.x, hole.size.h),
        ));
    }
    if hx2 < ax2 {
        pieces.push(Rect::from_loc_and_size((hx2, hole.loc.y), (ax2 - hx2, hole.size.h)));
    }

    pieces
}
