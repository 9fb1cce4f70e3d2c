//! Known geometry of the half field a camera is calibrated against.
//!
//! The field frame has its origin at the center mark, `x` along the field
//! length, `y` along the width and `z` up. The calibrated half is the one with
//! `x >= 0`. All lengths are in millimeters.

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::Vector3;

use crate::{Error, Result};

/// A straight field line segment on the ground plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldLine {
    /// Human readable name.
    pub name: &'static str,
    /// First endpoint (field frame).
    pub p1: Vector3<f64>,
    /// Second endpoint (field frame).
    pub p2: Vector3<f64>,
    /// `true` if the line runs parallel to the field x axis.
    pub horizontal: bool,
}

/// Half-field layout used as ground truth for calibration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize))]
pub struct CalibrationField {
    field_length: f64,
    field_width: f64,
}

#[cfg(feature = "serde-serialize")]
impl<'de> Deserialize<'de> for CalibrationField {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Dimensions {
            field_length: f64,
            field_width: f64,
        }
        let d = Dimensions::deserialize(deserializer)?;
        CalibrationField::new(d.field_length, d.field_width)
            .map_err(<D::Error as serde::de::Error>::custom)
    }
}

impl Default for CalibrationField {
    fn default() -> Self {
        Self {
            field_length: 6050.0,
            field_width: 4050.0,
        }
    }
}

impl CalibrationField {
    /// Construct a field layout.
    ///
    /// Returns `Err(Error::InvalidInput)` unless both dimensions are positive.
    pub fn new(field_length: f64, field_width: f64) -> Result<Self> {
        if !(field_length > 0.0 && field_width > 0.0) {
            return Err(Error::InvalidInput);
        }
        Ok(Self {
            field_length,
            field_width,
        })
    }

    /// Length of the full field, goal line to goal line.
    #[inline]
    pub fn field_length(&self) -> f64 {
        self.field_length
    }

    /// Width of the field, touch line to touch line.
    #[inline]
    pub fn field_width(&self) -> f64 {
        self.field_width
    }

    fn half_length(&self) -> f64 {
        self.field_length / 2.0
    }

    fn half_width(&self) -> f64 {
        self.field_width / 2.0
    }

    /// Corner where the goal line meets the `+y` touch line.
    pub fn left_corner(&self) -> Vector3<f64> {
        Vector3::new(self.half_length(), self.half_width(), 0.0)
    }

    /// Corner where the goal line meets the `-y` touch line.
    pub fn right_corner(&self) -> Vector3<f64> {
        Vector3::new(self.half_length(), -self.half_width(), 0.0)
    }

    /// Point where the half-way line meets the `+y` touch line.
    pub fn left_centerline(&self) -> Vector3<f64> {
        Vector3::new(0.0, self.half_width(), 0.0)
    }

    /// Point where the half-way line meets the `-y` touch line.
    pub fn right_centerline(&self) -> Vector3<f64> {
        Vector3::new(0.0, -self.half_width(), 0.0)
    }

    /// The four landmarks in the order left corner, right corner, left
    /// center line, right center line.
    pub fn landmarks(&self) -> [Vector3<f64>; 4] {
        [
            self.left_corner(),
            self.right_corner(),
            self.left_centerline(),
            self.right_centerline(),
        ]
    }

    /// The straight lines bounding the half field.
    pub fn field_lines(&self) -> Vec<FieldLine> {
        vec![
            FieldLine {
                name: "goal line",
                p1: self.right_corner(),
                p2: self.left_corner(),
                horizontal: false,
            },
            FieldLine {
                name: "half-way line",
                p1: self.right_centerline(),
                p2: self.left_centerline(),
                horizontal: false,
            },
            FieldLine {
                name: "left touch line",
                p1: self.left_centerline(),
                p2: self.left_corner(),
                horizontal: true,
            },
            FieldLine {
                name: "right touch line",
                p1: self.right_centerline(),
                p2: self.right_corner(),
                horizontal: true,
            },
        ]
    }
}
