//! 16-point compass rose labels for wind direction in degrees.

use std::fmt;

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompassPoint {
    N,
    NNE,
    NE,
    ENE,
    E,
    ESE,
    SE,
    SSE,
    S,
    SSW,
    SW,
    WSW,
    W,
    WNW,
    NW,
    NNW,
}

impl CompassPoint {
    /// Clockwise from north, one bucket every 22.5°.
    pub const ALL: [CompassPoint; 16] = [
        CompassPoint::N,
        CompassPoint::NNE,
        CompassPoint::NE,
        CompassPoint::ENE,
        CompassPoint::E,
        CompassPoint::ESE,
        CompassPoint::SE,
        CompassPoint::SSE,
        CompassPoint::S,
        CompassPoint::SSW,
        CompassPoint::SW,
        CompassPoint::WSW,
        CompassPoint::W,
        CompassPoint::WNW,
        CompassPoint::NW,
        CompassPoint::NNW,
    ];

    /// Bucket = floor((deg + 11.25) / 22.5) mod 16, wrapping negatives and
    /// values >= 360. Returns `None` for NaN / infinite input.
    pub fn from_degrees(degrees: f64) -> Option<Self> {
        if !degrees.is_finite() {
            return None;
        }
        let bucket = ((degrees + 11.25) / 22.5).floor();
        let index = bucket.rem_euclid(16.0) as usize;
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            CompassPoint::N => "N",
            CompassPoint::NNE => "NNE",
            CompassPoint::NE => "NE",
            CompassPoint::ENE => "ENE",
            CompassPoint::E => "E",
            CompassPoint::ESE => "ESE",
            CompassPoint::SE => "SE",
            CompassPoint::SSE => "SSE",
            CompassPoint::S => "S",
            CompassPoint::SSW => "SSW",
            CompassPoint::SW => "SW",
            CompassPoint::WSW => "WSW",
            CompassPoint::W => "W",
            CompassPoint::WNW => "WNW",
            CompassPoint::NW => "NW",
            CompassPoint::NNW => "NNW",
        }
    }
}

impl fmt::Display for CompassPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for CompassPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(degrees: f64) -> &'static str {
        CompassPoint::from_degrees(degrees).unwrap().label()
    }

    #[test]
    fn bucket_edges() {
        assert_eq!(label(0.0), "N");
        assert_eq!(label(11.24), "N");
        assert_eq!(label(11.26), "NNE");
        assert_eq!(label(348.75), "N");
        assert_eq!(label(348.74), "NNW");
    }

    #[test]
    fn wraps_out_of_range_input() {
        assert_eq!(label(360.0), "N");
        assert_eq!(label(-5.0), "N");
        assert_eq!(label(-90.0), "W");
        assert_eq!(label(450.0), "E");
        assert_eq!(label(-720.0), "N");
    }

    #[test]
    fn bucket_centres_walk_the_rose_in_order() {
        for (i, point) in CompassPoint::ALL.iter().enumerate() {
            assert_eq!(CompassPoint::from_degrees(i as f64 * 22.5), Some(*point));
        }
    }

    #[test]
    fn rejects_non_finite() {
        assert_eq!(CompassPoint::from_degrees(f64::NAN), None);
        assert_eq!(CompassPoint::from_degrees(f64::INFINITY), None);
    }

    #[test]
    fn serializes_as_label() {
        assert_eq!(serde_json::to_string(&CompassPoint::WSW).unwrap(), "\"WSW\"");
    }
}
