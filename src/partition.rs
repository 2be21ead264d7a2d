use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::NimbusError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisValue {
    Int(i64),
    Text(String),
}

impl AxisValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AxisValue::Int(value) => Some(*value),
            AxisValue::Text(_) => None,
        }
    }
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Int(value) => write!(f, "{value}"),
            AxisValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for AxisValue {
    fn from(value: i64) -> Self {
        AxisValue::Int(value)
    }
}

impl From<&str> for AxisValue {
    fn from(value: &str) -> Self {
        AxisValue::Text(value.to_string())
    }
}

impl From<String> for AxisValue {
    fn from(value: String) -> Self {
        AxisValue::Text(value)
    }
}

/// One combination of axis values, in axis order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition(Vec<(String, AxisValue)>);

impl Partition {
    pub fn get(&self, name: &str) -> Option<&AxisValue> {
        self.0
            .iter()
            .find(|(axis, _)| axis == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AxisValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl Serialize for Partition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Axis {
    name: String,
    values: Vec<AxisValue>,
}

/// Addresses the cartesian product of named axes by a single integer, so a
/// job-array scheduler can hand each invocation one unit of a sweep.
///
/// The last axis varies fastest. Negative indices count from the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionIndex {
    axes: Vec<Axis>,
}

impl PartitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an axis. Re-declaring a name replaces its values in place.
    pub fn axis<V: Into<AxisValue>>(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        match self.axes.iter_mut().find(|axis| axis.name == name) {
            Some(axis) => axis.values = values,
            None => self.axes.push(Axis {
                name: name.to_string(),
                values,
            }),
        }
        self
    }

    pub fn len(&self) -> usize {
        self.axes
            .iter()
            .fold(1usize, |acc, axis| acc.saturating_mul(axis.values.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn at(&self, index: isize) -> Option<Partition> {
        let len = self.signed_len();
        let index = if index < 0 { index + len } else { index };
        if !(0..len).contains(&index) {
            return None;
        }
        Some(self.unpack(index.unsigned_abs()))
    }

    /// Python-style `[start:stop:step]`.
    pub fn slice(
        &self,
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    ) -> Result<Vec<Partition>, NimbusError> {
        if step == 0 {
            return Err(NimbusError::InvalidPartition(
                "slice step cannot be zero".to_string(),
            ));
        }
        let len = self.signed_len();
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |bound: isize| {
            if bound < 0 {
                (bound + len).max(lower)
            } else {
                bound.min(upper)
            }
        };
        let start = start.map_or(if step < 0 { upper } else { lower }, clamp);
        let stop = stop.map_or(if step < 0 { lower } else { upper }, clamp);

        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(self.unpack(i.unsigned_abs()));
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = Partition> + '_ {
        (0..self.len()).map(|i| self.unpack(i))
    }

    fn signed_len(&self) -> isize {
        isize::try_from(self.len()).unwrap_or(isize::MAX)
    }

    fn unpack(&self, mut index: usize) -> Partition {
        let mut picked = Vec::with_capacity(self.axes.len());
        for axis in self.axes.iter().rev() {
            let n = axis.values.len();
            picked.push((axis.name.clone(), axis.values[index % n].clone()));
            index /= n;
        }
        picked.reverse();
        Partition(picked)
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes = self
            .axes
            .iter()
            .map(|axis| format!("{}({})", axis.name, axis.values.len()))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "PartitionIndex [{axes}]")
    }
}

/// Parses `name=a,b,c`, `name=lo..hi` or `name=lo..=hi`.
pub fn parse_axis_spec(spec: &str) -> Result<(String, Vec<AxisValue>), NimbusError> {
    let invalid = || NimbusError::InvalidPartition(format!("bad axis spec {spec:?}"));
    let (name, values) = spec.split_once('=').ok_or_else(invalid)?;
    let name = name.trim();
    if name.is_empty() || values.trim().is_empty() {
        return Err(invalid());
    }
    if let Some(range) = parse_int_range(values)? {
        return Ok((name.to_string(), range.map(AxisValue::Int).collect()));
    }
    let values = values
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| match value.parse::<i64>() {
            Ok(n) => AxisValue::Int(n),
            Err(_) => AxisValue::Text(value.to_string()),
        })
        .collect();
    Ok((name.to_string(), values))
}

/// `lo..hi` (exclusive) or `lo..=hi` (inclusive). `None` when `value` is not a range.
pub fn parse_int_range(
    value: &str,
) -> Result<Option<std::ops::RangeInclusive<i64>>, NimbusError> {
    let (lo, hi, inclusive) = match value.split_once("..=") {
        Some((lo, hi)) => (lo, hi, true),
        None => match value.split_once("..") {
            Some((lo, hi)) => (lo, hi, false),
            None => return Ok(None),
        },
    };
    let parse = |part: &str| {
        part.trim().parse::<i64>().map_err(|_| {
            NimbusError::InvalidPartition(format!("range bounds must be integers: {value:?}"))
        })
    };
    let (lo, hi) = (parse(lo)?, parse(hi)?);
    let hi = if inclusive {
        hi
    } else {
        hi.checked_sub(1).ok_or_else(|| {
            NimbusError::InvalidPartition(format!("range end out of bounds: {value:?}"))
        })?
    };
    Ok(Some(lo..=hi))
}
