use crate::sample::Sample;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inclusive plausibility range for one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Physical limits of the sensors deployed so far.
pub fn default_bounds() -> HashMap<String, Bounds> {
    [
        ("temperature", Bounds::new(-20.0, 40.0)),
        ("humidity", Bounds::new(0.0, 100.0)),
        ("pressure", Bounds::new(900.0, 1100.0)),
        ("cpu_freq", Bounds::new(0.0, 2000.0)),
        ("cpu_temp", Bounds::new(0.0, 120.0)),
        ("mem_load", Bounds::new(0.0, 100.0)),
    ]
    .into_iter()
    .map(|(name, bounds)| (name.to_string(), bounds))
    .collect()
}

/// Range check per field. Never fails; out-of-range and non-finite values
/// become null, everything else passes through untouched.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    bounds: HashMap<String, Bounds>,
}

impl Validator {
    pub fn new(bounds: HashMap<String, Bounds>) -> Self {
        Self { bounds }
    }

    /// Copy of this validator with `overrides` taking precedence per field.
    pub fn with_overrides(&self, overrides: &HashMap<String, Bounds>) -> Self {
        let mut bounds = self.bounds.clone();
        bounds.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        Self { bounds }
    }

    pub fn bounds(&self, field: &str) -> Option<Bounds> {
        self.bounds.get(field).copied()
    }

    pub fn validate(&self, field: &str, raw: Option<f64>) -> Option<f64> {
        let value = raw?;
        if !value.is_finite() {
            return None;
        }
        match self.bounds.get(field) {
            Some(bounds) if !bounds.contains(value) => None,
            _ => Some(value),
        }
    }

    /// Validates every field of `sample` in place and returns the names of the
    /// fields that were nulled.
    pub fn apply(&self, sample: &mut Sample) -> Vec<String> {
        let mut nulled = Vec::new();
        for (name, value) in sample.fields.iter_mut() {
            let checked = self.validate(name, *value);
            if value.is_some() && checked.is_none() {
                nulled.push(name.clone());
            }
            *value = checked;
        }
        nulled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn validator() -> Validator {
        Validator::new(default_bounds())
    }

    #[test]
    fn temperature_outside_range_is_nulled() {
        let v = validator();
        assert_eq!(v.validate("temperature", Some(-25.0)), None);
        assert_eq!(v.validate("temperature", Some(22.5)), Some(22.5));
    }

    #[test]
    fn bounds_are_inclusive() {
        let v = validator();
        assert_eq!(v.validate("temperature", Some(-20.0)), Some(-20.0));
        assert_eq!(v.validate("temperature", Some(40.0)), Some(40.0));
        assert_eq!(v.validate("temperature", Some(40.000_1)), None);
    }

    #[test]
    fn null_passes_through() {
        assert_eq!(validator().validate("humidity", None), None);
    }

    #[test]
    fn unknown_fields_are_not_range_checked() {
        let v = validator();
        assert_eq!(v.validate("lux", Some(1.0e6)), Some(1.0e6));
        assert_eq!(v.validate("lux", Some(f64::NAN)), None);
        assert_eq!(v.validate("lux", Some(f64::INFINITY)), None);
    }

    #[test]
    fn validation_is_idempotent() {
        let v = validator();
        let inputs = [
            None,
            Some(-1000.0),
            Some(-20.0),
            Some(0.0),
            Some(22.5),
            Some(40.0),
            Some(1050.0),
            Some(f64::NAN),
        ];
        for field in ["temperature", "humidity", "pressure", "co2"] {
            for raw in inputs {
                let once = v.validate(field, raw);
                assert_eq!(v.validate(field, once), once, "{field} {raw:?}");
            }
        }
    }

    #[test]
    fn apply_nulls_fields_independently() {
        let v = validator();
        let mut sample = Sample::new("live logging", Utc::now())
            .with_field("temperature", Some(18.25))
            .with_field("pressure", Some(12.0))
            .with_field("humidity", None);

        let nulled = v.apply(&mut sample);

        assert_eq!(nulled, vec!["pressure".to_string()]);
        assert_eq!(sample.fields["temperature"], Some(18.25));
        assert_eq!(sample.fields["pressure"], None);
        assert_eq!(sample.fields["humidity"], None);
    }

    #[test]
    fn overrides_replace_global_bounds() {
        let overrides = HashMap::from([("temperature".to_string(), Bounds::new(-40.0, 60.0))]);
        let v = validator().with_overrides(&overrides);
        assert_eq!(v.validate("temperature", Some(-25.0)), Some(-25.0));
        assert_eq!(v.bounds("humidity"), Some(Bounds::new(0.0, 100.0)));
    }
}
