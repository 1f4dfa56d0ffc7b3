//! Geometry helpers shared across the composition pipeline.
//!
//! Display frames and damage are integer rectangles in screen coordinates,
//! source crops are fractional rectangles in buffer coordinates. Both are
//! covered by the same [`Rectangle`] type, generic over its coordinate.

use std::fmt;
use std::ops::{Add, Sub};

mod fd;
pub use fd::DeviceFd;

/// Trait for types serving as a coordinate of the geometry utils.
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// A coordinate that is 0
    const ZERO: Self;

    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }

    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;
}

impl Coordinate for f32 {
    const ZERO: f32 = 0.0;
}

/// A point in 2D space
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point<N> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
}

impl<N> From<(N, N)> for Point<N> {
    fn from((x, y): (N, N)) -> Self {
        Point { x, y }
    }
}

/// A two-dimensional extent
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Size<N> {
    /// width
    pub w: N,
    /// height
    pub h: N,
}

impl<N> From<(N, N)> for Size<N> {
    fn from((w, h): (N, N)) -> Self {
        Size { w, h }
    }
}

/// A rectangle defined by its top-left corner and dimensions
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rectangle<N> {
    /// Location of the top-left corner
    pub loc: Point<N>,
    /// Size of the rectangle
    pub size: Size<N>,
}

impl<N: Coordinate> Rectangle<N> {
    /// Create a new [`Rectangle`] from a location and a size
    pub fn from_loc_and_size(loc: impl Into<Point<N>>, size: impl Into<Size<N>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left and bottom-right corners
    pub fn from_extremities(topleft: impl Into<Point<N>>, bottomright: impl Into<Point<N>>) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: Size {
                w: bottomright.x - topleft.x,
                h: bottomright.y - topleft.y,
            },
        }
    }

    /// Whether the rectangle covers no area
    pub fn is_empty(&self) -> bool {
        self.size.w <= N::ZERO || self.size.h <= N::ZERO
    }

    /// Coordinates of the bottom-right corner
    pub fn bottom_right(&self) -> Point<N> {
        Point {
            x: self.loc.x + self.size.w,
            y: self.loc.y + self.size.h,
        }
    }

    /// Checks whether given point is inside the rectangle
    pub fn contains(&self, point: impl Into<Point<N>>) -> bool {
        let p = point.into();
        let br = self.bottom_right();
        p.x >= self.loc.x && p.x < br.x && p.y >= self.loc.y && p.y < br.y
    }

    /// Checks whether the two rectangles overlap
    pub fn overlaps(&self, other: &Rectangle<N>) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let sbr = self.bottom_right();
        let obr = other.bottom_right();
        self.loc.x < obr.x && other.loc.x < sbr.x && self.loc.y < obr.y && other.loc.y < sbr.y
    }

    /// Merges two rectangles, producing the axis-aligned bounding box of both.
    ///
    /// An empty rectangle merged with anything yields the other rectangle.
    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let sbr = self.bottom_right();
        let obr = other.bottom_right();
        Rectangle::from_extremities(
            (self.loc.x.min(other.loc.x), self.loc.y.min(other.loc.y)),
            (sbr.x.max(obr.x), sbr.y.max(obr.y)),
        )
    }
}

bitflags::bitflags! {
    /// Accumulated display transform, expressed as the set of operations the
    /// display controller applies at scan-out time.
    ///
    /// Rotations accumulate by OR-ing bits in, matching how rotation requests
    /// arrive one step at a time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Transform: u32 {
        /// Mirror horizontally
        const REFLECT_X = 1 << 0;
        /// Mirror vertically
        const REFLECT_Y = 1 << 1;
        /// Rotate by 90 degrees
        const ROT_90 = 1 << 2;
        /// Rotate by 180 degrees
        const ROT_180 = 1 << 3;
        /// Rotate by 270 degrees
        const ROT_270 = 1 << 4;
    }
}
