use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("expected four comma separated integers LEFT,TOP,RIGHT,BOTTOM, got {0:?}")]
    Format(String),
    #[error("region {0} has no area")]
    Empty(Region),
}

/// Screen or frame rectangle `(left, top, right, bottom)`, right/bottom
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Region {
    /// Builds a region from two opposite corners in any order.
    pub fn from_corners(x0: i32, y0: i32, x1: i32, y1: i32) -> Result<Self, RegionError> {
        let region = Self {
            left: x0.min(x1),
            top: y0.min(y1),
            right: x0.max(x1),
            bottom: y0.max(y1),
        };
        // sides must fit in i32 for width/height to be meaningful
        let (Some(width), Some(height)) = (
            region.right.checked_sub(region.left),
            region.bottom.checked_sub(region.top),
        ) else {
            return Err(RegionError::Format(region.to_string()));
        };
        if width == 0 || height == 0 {
            return Err(RegionError::Empty(region));
        }
        Ok(region)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.left as f32 && x < self.right as f32 && y >= self.top as f32 && y < self.bottom as f32
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.left, self.top, self.right, self.bottom)
    }
}

impl FromStr for Region {
    type Err = RegionError;

    /// Accepts `264,342,1051,868` as well as the selector's tuple output
    /// `(264, 342, 1051, 868)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s.trim().trim_start_matches('(').trim_end_matches(')');
        let parts: Vec<i32> = inner
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .map_err(|_| RegionError::Format(s.to_string()))?;
        match parts[..] {
            [l, t, r, b] => Region::from_corners(l, t, r, b),
            _ => Err(RegionError::Format(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_tuple_forms() {
        let expected = Region {
            left: 264,
            top: 342,
            right: 1051,
            bottom: 868,
        };
        assert_eq!("264,342,1051,868".parse::<Region>().unwrap(), expected);
        assert_eq!("(264, 342, 1051, 868)".parse::<Region>().unwrap(), expected);
    }

    #[test]
    fn corners_are_normalised() {
        let region = "1051,868,264,342".parse::<Region>().unwrap();
        assert_eq!((region.left, region.top), (264, 342));
        assert_eq!((region.width(), region.height()), (787, 526));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!("1,2,3".parse::<Region>(), Err(RegionError::Format(_))));
        assert!(matches!("a,b,c,d".parse::<Region>(), Err(RegionError::Format(_))));
        assert!(matches!("5,5,5,9".parse::<Region>(), Err(RegionError::Empty(_))));
    }

    #[test]
    fn rejects_sides_wider_than_i32() {
        assert!(matches!(
            "-2147483648,0,2147483647,1".parse::<Region>(),
            Err(RegionError::Format(_))
        ));
        assert!(matches!(
            Region::from_corners(0, i32::MIN, 1, i32::MAX),
            Err(RegionError::Format(_))
        ));
        let widest = Region::from_corners(-1, 0, i32::MAX - 1, 1).unwrap();
        assert_eq!(widest.width(), i32::MAX);
    }

    #[test]
    fn contains_is_right_bottom_exclusive() {
        let region = Region::from_corners(0, 0, 10, 10).unwrap();
        assert!(region.contains(0.0, 0.0));
        assert!(region.contains(9.5, 9.5));
        assert!(!region.contains(10.0, 5.0));
        assert!(!region.contains(-0.1, 5.0));
    }
}
