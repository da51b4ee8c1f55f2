//! Multi-valued parameter requests
//!
//! A batch request maps each parameter to one value or to a sequence of
//! values; [`ParamGrid::expand`] turns it into the cartesian product of
//! individual parameter sets.

use chrono::{Datelike, NaiveDate, Weekday};
use marketcache_common::{ParamValue, Params};
use std::collections::BTreeMap;

/// One value or a sequence of values for a parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSpec {
    One(ParamValue),
    Many(Vec<ParamValue>),
}

impl ParamSpec {
    fn values(&self) -> &[ParamValue] {
        match self {
            ParamSpec::One(value) => std::slice::from_ref(value),
            ParamSpec::Many(values) => values,
        }
    }
}

/// Parameter name -> scalar or sequence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGrid {
    specs: BTreeMap<String, ParamSpec>,
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.specs.insert(name.into(), ParamSpec::One(value.into()));
        self
    }

    pub fn many<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.specs.insert(name.into(), ParamSpec::Many(values));
        self
    }

    /// Number of parameter sets [`expand`](Self::expand) yields
    pub fn len(&self) -> usize {
        self.specs.values().map(|spec| spec.values().len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cartesian product, keys in sorted order, sequences in given order.
    ///
    /// A grid without parameters yields exactly one empty set; a grid with an
    /// empty sequence yields nothing.
    pub fn expand(&self) -> Vec<Params> {
        let mut combos: Vec<Params> = vec![Params::new()];
        for (name, spec) in &self.specs {
            let values = spec.values();
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut params = combo.clone();
                    params.insert(name.clone(), value.clone());
                    next.push(params);
                }
            }
            combos = next;
        }
        combos
    }
}

impl From<Params> for ParamGrid {
    fn from(params: Params) -> Self {
        Self {
            specs: params
                .into_iter()
                .map(|(name, value)| (name, ParamSpec::One(value)))
                .collect(),
        }
    }
}

/// Inclusive range of weekdays, for daily exchange feeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Weekdays from `start` to `end`, both inclusive. No holiday calendar.
    pub fn weekdays(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_cartesian_product() {
        let grid = ParamGrid::new()
            .one("name", "test")
            .many("color", ["red", "blue", "green"])
            .many("size", [1i64, 2]);

        let sets = grid.expand();
        assert_eq!(grid.len(), 6);
        assert_eq!(sets.len(), 6);
        assert!(sets.iter().all(|p| p["name"] == ParamValue::from("test")));
        assert_eq!(sets[0]["color"], ParamValue::from("red"));
        assert_eq!(sets[0]["size"], ParamValue::Integer(1));
        assert_eq!(sets[1]["size"], ParamValue::Integer(2));
        assert_eq!(sets[5]["color"], ParamValue::from("green"));
    }

    #[test]
    fn test_expand_edges() {
        assert_eq!(ParamGrid::new().expand(), vec![Params::new()]);

        let empty = ParamGrid::new().many("refdate", Vec::<NaiveDate>::new());
        assert!(empty.is_empty());
        assert!(empty.expand().is_empty());
    }

    #[test]
    fn test_weekdays_skip_weekends() {
        // 2023-05-05 is a Friday
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 5, 5).unwrap(),
            NaiveDate::from_ymd_opt(2023, 5, 9).unwrap(),
        );
        let days = range.weekdays();
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2023, 5, 5).unwrap(),
                NaiveDate::from_ymd_opt(2023, 5, 8).unwrap(),
                NaiveDate::from_ymd_opt(2023, 5, 9).unwrap(),
            ]
        );
    }
}
