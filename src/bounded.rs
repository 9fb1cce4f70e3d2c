//! Bounded scalars and the flat name → value/bounds view used by settings UIs.

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Closed interval `[min, max]` a scalar parameter must lie in.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Bounds {
    /// Smallest admissible value.
    pub min: f64,
    /// Largest admissible value.
    pub max: f64,
}

impl Bounds {
    /// Create bounds. `min` must not exceed `max`.
    #[inline]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// `true` if `value` is finite and within `[min, max]`.
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }

    /// Clamp `value` into `[min, max]`.
    #[inline]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Return `value` unchanged if admissible, else `Error::OutOfBounds`.
    pub fn check(&self, name: &str, value: f64) -> Result<f64> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(Error::OutOfBounds {
                name: name.to_string(),
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// A real scalar that is always within its bounds.
///
/// Setting a value outside the bounds is rejected and leaves the current value
/// untouched. Deserializing a value outside its bounds fails.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize))]
pub struct BoundedScalar {
    value: f64,
    bounds: Bounds,
}

impl BoundedScalar {
    /// Create a scalar. The initial value is clamped into `bounds`.
    pub fn new(value: f64, min: f64, max: f64) -> Self {
        let bounds = Bounds::new(min, max);
        Self {
            value: bounds.clamp(value),
            bounds,
        }
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Bounds of this scalar.
    #[inline]
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Set a new value, rejecting anything outside the bounds.
    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        self.value = self.bounds.check(name, value)?;
        Ok(())
    }
}

#[cfg(feature = "serde-serialize")]
#[derive(Deserialize)]
struct BoundedScalarFields {
    value: f64,
    bounds: Bounds,
}

#[cfg(feature = "serde-serialize")]
impl<'de> Deserialize<'de> for BoundedScalar {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = BoundedScalarFields::deserialize(deserializer)?;
        if !(raw.bounds.min <= raw.bounds.max) {
            return Err(serde::de::Error::custom(format!(
                "empty bounds [{}, {}]",
                raw.bounds.min, raw.bounds.max
            )));
        }
        let value = raw
            .bounds
            .check("value", raw.value)
            .map_err(<D::Error as serde::de::Error>::custom)?;
        Ok(Self {
            value,
            bounds: raw.bounds,
        })
    }
}

/// One row of the settings view: a named scalar with its bounds.
///
/// External settings layers (sliders, persistence) bind to these rows by
/// `name` and write values back through `set_setting` on the owning struct.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize))]
pub struct Setting {
    /// Stable identifier of the scalar.
    pub name: &'static str,
    /// Current value.
    pub value: f64,
    /// Smallest admissible value.
    pub min: f64,
    /// Largest admissible value.
    pub max: f64,
    /// `false` for values that are derived and cannot be written.
    pub writable: bool,
}

impl Setting {
    pub(crate) fn from_scalar(name: &'static str, scalar: &BoundedScalar) -> Self {
        Self {
            name,
            value: scalar.get(),
            min: scalar.bounds().min,
            max: scalar.bounds().max,
            writable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_and_keeps_value() {
        let mut s = BoundedScalar::new(0.5, 0.0, 2.0);
        let err = s.set("distortion", 2.5).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        assert_eq!(s.get(), 0.5);
        assert!(s.set("distortion", f64::NAN).is_err());
        s.set("distortion", 2.0).unwrap();
        assert_eq!(s.get(), 2.0);
    }

    #[test]
    fn initial_value_is_clamped() {
        let s = BoundedScalar::new(-3.0, 0.0, 1.0);
        assert_eq!(s.get(), 0.0);
    }

    #[cfg(feature = "serde-serialize")]
    #[test]
    fn deserializing_checks_the_bounds() {
        let ok: BoundedScalar =
            serde_yaml::from_str("value: 1.5\nbounds: {min: 0.0, max: 2.0}").unwrap();
        assert_eq!(ok.get(), 1.5);
        assert_eq!(ok.bounds(), Bounds::new(0.0, 2.0));

        let above = "value: 9.0\nbounds: {min: 0.0, max: 2.0}";
        assert!(serde_yaml::from_str::<BoundedScalar>(above).is_err());
        let inverted = "value: 1.0\nbounds: {min: 2.0, max: 0.0}";
        assert!(serde_yaml::from_str::<BoundedScalar>(inverted).is_err());
    }
}
