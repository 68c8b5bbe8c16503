use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MEASUREMENT: &str = "live logging";

pub type Tags = BTreeMap<String, String>;

/// Field values keyed by name. `None` is an explicit "no value this tick";
/// a key that is absent means the field does not apply to the source.
pub type Fields = BTreeMap<String, Option<f64>>;

/// One normalized telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub measurement: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: Fields,
}

impl Sample {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Tags::new(),
            timestamp,
            fields: Fields::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Option<f64>) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// True when no field carries a value (a gap in the series).
    pub fn is_gap(&self) -> bool {
        self.fields.values().all(Option::is_none)
    }

    pub fn timestamp_nanos(&self) -> Option<i64> {
        self.timestamp.timestamp_nanos_opt()
    }
}

/// What an adapter always stamps onto its samples: measurement, tags and the
/// full set of field names it reports.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTemplate {
    pub measurement: String,
    pub tags: Tags,
    pub field_names: Vec<String>,
    failure_values: BTreeMap<String, f64>,
}

impl SampleTemplate {
    pub fn new<I, S>(measurement: impl Into<String>, tags: Tags, field_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            measurement: measurement.into(),
            tags,
            field_names: field_names.into_iter().map(Into::into).collect(),
            failure_values: BTreeMap::new(),
        }
    }

    /// Value reported for `field` when a read fails, instead of null.
    pub fn with_failure_value(mut self, field: impl Into<String>, value: f64) -> Self {
        let field = field.into();
        if !self.field_names.contains(&field) {
            self.field_names.push(field.clone());
        }
        self.failure_values.insert(field, value);
        self
    }

    /// Builds a sample from a successful read. Declared fields the read did
    /// not produce are present as null.
    pub fn sample(&self, timestamp: DateTime<Utc>, mut fields: Fields) -> Sample {
        for name in &self.field_names {
            fields.entry(name.clone()).or_insert(None);
        }
        Sample {
            measurement: self.measurement.clone(),
            tags: self.tags.clone(),
            timestamp,
            fields,
        }
    }

    /// Builds the sample reported for a failed read: every declared field is
    /// null except configured failure sentinels.
    pub fn failure(&self, timestamp: DateTime<Utc>) -> Sample {
        let fields = self
            .field_names
            .iter()
            .map(|name| (name.clone(), self.failure_values.get(name).copied()))
            .collect();
        Sample {
            measurement: self.measurement.clone(),
            tags: self.tags.clone(),
            timestamp,
            fields,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Str(String),
    Int(i64),
    Float(f64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Str(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| D::Error::custom(format!("invalid timestamp {raw:?}: {err}"))),
        RawTimestamp::Int(ms) => millis_to_dt(ms)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {ms}"))),
        RawTimestamp::Float(ts) => millis_to_dt((ts * 1000.0) as i64)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {ts}"))),
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
