//! Sparse integer-keyed operator parameters, as written in ncnn param files.
use std::collections::BTreeMap;

use anyhow::{bail, ensure, Context};
use itertools::Itertools;
use serde::Serialize;

/// Keys at or below `-ARRAY_KEY_BASE` announce an array parameter.
pub const ARRAY_KEY_BASE: i32 = 23300;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v)
    }
}

impl From<Vec<i32>> for ParamValue {
    fn from(v: Vec<i32>) -> Self {
        ParamValue::Ints(v)
    }
}

impl From<Vec<f32>> for ParamValue {
    fn from(v: Vec<f32>) -> Self {
        ParamValue::Floats(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParamDict {
    values: BTreeMap<u32, ParamValue>,
}

fn is_float_literal(s: &str) -> bool {
    s.chars().any(|c| c == '.' || c == 'e' || c == 'E')
}

fn parse_int(s: &str) -> anyhow::Result<i32> {
    s.parse::<i32>()
        .with_context(|| format!("invalid integer parameter value {s:?}"))
}

fn parse_float(s: &str) -> anyhow::Result<f32> {
    s.parse::<f32>()
        .with_context(|| format!("invalid float parameter value {s:?}"))
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `key=value` token of a layer line.
    pub fn parse_entry(&mut self, token: &str) -> anyhow::Result<()> {
        let Some((key, value)) = token.split_once('=') else {
            bail!("parameter {token:?} is not of the form key=value");
        };
        let key = parse_int(key)?;
        if key <= -ARRAY_KEY_BASE {
            let id = (-key - ARRAY_KEY_BASE) as u32;
            let mut items = value.split(',');
            let count = items
                .next()
                .map(parse_int)
                .transpose()?
                .unwrap_or_default();
            let items = items.collect_vec();
            ensure!(
                count >= 0 && items.len() == count as usize,
                "array parameter {id} announces {count} items but holds {}",
                items.len()
            );
            let array = if items.iter().any(|s| is_float_literal(s)) {
                ParamValue::Floats(items.into_iter().map(parse_float).collect::<anyhow::Result<_>>()?)
            } else {
                ParamValue::Ints(items.into_iter().map(parse_int).collect::<anyhow::Result<_>>()?)
            };
            self.values.insert(id, array);
        } else {
            ensure!(key >= 0, "invalid parameter key {key}");
            let scalar = if is_float_literal(value) {
                ParamValue::Float(parse_float(value)?)
            } else {
                ParamValue::Int(parse_int(value)?)
            };
            self.values.insert(key as u32, scalar);
        }
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&ParamValue> {
        self.values.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.values.contains_key(&id)
    }

    pub fn get_int(&self, id: u32, default: i32) -> i32 {
        match self.values.get(&id) {
            Some(ParamValue::Int(v)) => *v,
            Some(ParamValue::Float(v)) => *v as i32,
            _ => default,
        }
    }

    pub fn get_float(&self, id: u32, default: f32) -> f32 {
        match self.values.get(&id) {
            Some(ParamValue::Float(v)) => *v,
            Some(ParamValue::Int(v)) => *v as f32,
            _ => default,
        }
    }

    pub fn get_ints(&self, id: u32) -> Option<Vec<i32>> {
        match self.values.get(&id)? {
            ParamValue::Ints(v) => Some(v.clone()),
            ParamValue::Floats(v) => Some(v.iter().map(|f| *f as i32).collect()),
            _ => None,
        }
    }

    pub fn get_floats(&self, id: u32) -> Option<Vec<f32>> {
        match self.values.get(&id)? {
            ParamValue::Floats(v) => Some(v.clone()),
            ParamValue::Ints(v) => Some(v.iter().map(|i| *i as f32).collect()),
            _ => None,
        }
    }

    /// Non-negative integer parameter, e.g. a channel count.
    pub fn get_usize(&self, id: u32, default: usize) -> anyhow::Result<usize> {
        let v = self.get_int(id, default as i32);
        usize::try_from(v).with_context(|| format!("parameter {id} must be non-negative, got {v}"))
    }

    pub fn set(&mut self, id: u32, value: impl Into<ParamValue>) {
        self.values.insert(id, value.into());
    }

    pub fn remove(&mut self, id: u32) -> Option<ParamValue> {
        self.values.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ParamValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The ` key=value` tokens in ascending key order.
    pub fn to_text(&self) -> String {
        self.values
            .iter()
            .map(|(id, value)| format_value(*id, value))
            .join("")
    }
}

fn format_value(id: u32, value: &ParamValue) -> String {
    let array_key = -(ARRAY_KEY_BASE + id as i32);
    match value {
        ParamValue::Int(v) => format!(" {id}={v}"),
        ParamValue::Float(v) => format!(" {id}={v:.6}"),
        ParamValue::Ints(v) => format!(
            " {array_key}={}{}",
            v.len(),
            v.iter().map(|x| format!(",{x}")).join("")
        ),
        ParamValue::Floats(v) => format!(
            " {array_key}={}{}",
            v.len(),
            v.iter().map(|x| format!(",{x:.6}")).join("")
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_scalars_and_arrays() {
        let mut pd = ParamDict::new();
        for token in ["0=16", "1=0.5", "-23302=3,-233,-233,-233", "-23303=2,1.5,2"] {
            pd.parse_entry(token).unwrap();
        }
        assert_eq!(pd.get_int(0, 0), 16);
        assert_eq!(pd.get_float(1, 0.0), 0.5);
        assert_eq!(pd.get_ints(2), Some(vec![-233, -233, -233]));
        assert_eq!(pd.get_floats(3), Some(vec![1.5, 2.0]));
        assert_eq!(pd.get_ints(0), None);
        assert_eq!(pd.get_int(7, 1), 1);
    }

    #[test]
    fn array_values_keep_their_type() {
        let mut pd = ParamDict::new();
        pd.parse_entry("-23309=3,12,15,-7").unwrap();
        pd.parse_entry("-23301=2,0.1,0.2").unwrap();
        assert_eq!(pd.get_ints(9), Some(vec![12, 15, -7]));
        assert_eq!(pd.get_floats(1), Some(vec![0.1, 0.2]));
    }

    #[test]
    fn rejects_inconsistent_array_length() {
        let mut pd = ParamDict::new();
        assert!(pd.parse_entry("-23300=3,1,2").is_err());
        assert!(pd.parse_entry("nonsense").is_err());
        assert!(pd.parse_entry("-5=1").is_err());
    }

    #[test]
    fn writes_in_key_order() {
        let mut pd = ParamDict::new();
        pd.set(8, 1);
        pd.set(0, 32);
        pd.set(9, vec![3, -7]);
        pd.set(2, 0.25f32);
        assert_eq!(pd.to_text(), " 0=32 2=0.250000 8=1 -23309=2,3,-7");
    }
}
