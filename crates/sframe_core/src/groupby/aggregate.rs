//! Aggregator implementations.
//!
//! An aggregator is a small state machine: it is cloned per group,
//! fed one row at a time, combined with instances from other
//! partitions, and finally emits a single value. State survives a
//! round trip through `save`/`load` so partially aggregated groups can
//! spill to disk.

use std::any::Any;
use std::io::{Read, Write};

use sframe_error::{Result, SframeError};

use crate::values::encoding::{decode_value, encode_value, read_u64, write_u64};
use crate::values::{Value, ValueType};

pub trait AggregateValue: Send + Sync {
    /// The operator name, as used in output column naming.
    fn name(&self) -> &'static str;

    /// A fresh zero-state instance of the same operator.
    fn new_instance(&self) -> Box<dyn AggregateValue>;

    /// Whether the operator accepts an input column of this type. For
    /// two-column operators this constrains the first column only.
    fn support_type(&self, ty: ValueType) -> bool;

    /// Number of input columns consumed per row.
    fn num_input_columns(&self) -> usize {
        1
    }

    /// Fix the input column types and report the output type.
    fn set_input_types(&mut self, types: &[ValueType]) -> Result<ValueType>;

    /// Fold one row into the state. `values` has `num_input_columns`
    /// entries.
    fn add_element(&mut self, values: &[&Value]) -> Result<()>;

    /// Merge another instance of the same operator into this one.
    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()>;

    /// The aggregated result.
    fn emit(&self) -> Value;

    fn save(&self, out: &mut dyn Write) -> Result<()>;
    fn load(&mut self, input: &mut dyn Read) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

fn downcast<'a, T: 'static>(other: &'a dyn AggregateValue, name: &str) -> Result<&'a T> {
    other.as_any().downcast_ref::<T>().ok_or_else(|| {
        SframeError::new(format!("Cannot combine mismatched '{name}' aggregators"))
    })
}

fn numeric_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Look up an aggregator by operator name.
pub fn aggregator_for(op: &str) -> Result<Box<dyn AggregateValue>> {
    let agg: Box<dyn AggregateValue> = match op {
        "sum" => Box::new(SumAggregator::default()),
        "vector_sum" => Box::new(VectorSumAggregator::default()),
        "count" => Box::new(CountAggregator::default()),
        "min" => Box::new(MinMaxAggregator::min()),
        "max" => Box::new(MinMaxAggregator::max()),
        "mean" => Box::new(MeanAggregator::default()),
        "variance" => Box::new(VarianceAggregator::variance()),
        "stdv" => Box::new(VarianceAggregator::stdv()),
        "count_distinct" => Box::new(CountDistinctAggregator::default()),
        "select_one" => Box::new(SelectOneAggregator::default()),
        "argmin" => Box::new(ArgExtremeAggregator::argmin()),
        "argmax" => Box::new(ArgExtremeAggregator::argmax()),
        other => {
            return Err(SframeError::new(format!(
                "Unknown aggregation operator '{other}'"
            )))
        }
    };
    Ok(agg)
}

/// Numeric sum. Integer input stays integer, float input stays float.
/// Undefined rows are skipped.
#[derive(Debug, Default)]
pub struct SumAggregator {
    int_sum: i64,
    float_sum: f64,
    is_float: bool,
}

impl AggregateValue for SumAggregator {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(SumAggregator {
            is_float: self.is_float,
            ..SumAggregator::default()
        })
    }

    fn support_type(&self, ty: ValueType) -> bool {
        ty.is_numeric()
    }

    fn set_input_types(&mut self, types: &[ValueType]) -> Result<ValueType> {
        self.is_float = types[0] == ValueType::Float;
        Ok(types[0])
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        match values[0] {
            Value::Integer(i) => {
                self.int_sum = self.int_sum.wrapping_add(*i);
                self.float_sum += *i as f64;
            }
            Value::Float(f) => self.float_sum += f,
            _ => (),
        }
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &SumAggregator = downcast(other, self.name())?;
        self.int_sum = self.int_sum.wrapping_add(other.int_sum);
        self.float_sum += other.float_sum;
        Ok(())
    }

    fn emit(&self) -> Value {
        if self.is_float {
            Value::Float(self.float_sum)
        } else {
            Value::Integer(self.int_sum)
        }
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        write_u64(&mut out, self.int_sum as u64)?;
        write_u64(&mut out, self.float_sum.to_bits())?;
        Ok(())
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.int_sum = read_u64(&mut input)? as i64;
        self.float_sum = f64::from_bits(read_u64(&mut input)?);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Element-wise sum of vectors. A vector of a different length than the
/// ones seen before poisons the group, which then emits Undefined.
#[derive(Debug, Default)]
pub struct VectorSumAggregator {
    sum: Option<Vec<f64>>,
    poisoned: bool,
}

impl AggregateValue for VectorSumAggregator {
    fn name(&self) -> &'static str {
        "vector_sum"
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(VectorSumAggregator::default())
    }

    fn support_type(&self, ty: ValueType) -> bool {
        ty == ValueType::Vector
    }

    fn set_input_types(&mut self, _types: &[ValueType]) -> Result<ValueType> {
        Ok(ValueType::Vector)
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        if self.poisoned {
            return Ok(());
        }
        let Value::Vector(v) = values[0] else {
            return Ok(());
        };
        match &mut self.sum {
            None => self.sum = Some(v.clone()),
            Some(sum) if sum.len() == v.len() => {
                for (s, x) in sum.iter_mut().zip(v) {
                    *s += x;
                }
            }
            Some(_) => self.poisoned = true,
        }
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &VectorSumAggregator = downcast(other, self.name())?;
        if other.poisoned {
            self.poisoned = true;
        }
        if let Some(v) = &other.sum {
            self.add_element(&[&Value::Vector(v.clone())])?;
        }
        Ok(())
    }

    fn emit(&self) -> Value {
        if self.poisoned {
            return Value::Undefined;
        }
        match &self.sum {
            Some(v) => Value::Vector(v.clone()),
            None => Value::Undefined,
        }
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        write_u64(&mut out, self.poisoned as u64)?;
        let value = match &self.sum {
            Some(v) => Value::Vector(v.clone()),
            None => Value::Undefined,
        };
        encode_value(&mut out, &value)
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.poisoned = read_u64(&mut input)? != 0;
        self.sum = match decode_value(&mut input)? {
            Value::Vector(v) => Some(v),
            _ => None,
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Row count, including Undefined rows.
#[derive(Debug, Default)]
pub struct CountAggregator {
    count: u64,
}

impl AggregateValue for CountAggregator {
    fn name(&self) -> &'static str {
        "count"
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(CountAggregator::default())
    }

    fn support_type(&self, _ty: ValueType) -> bool {
        true
    }

    fn set_input_types(&mut self, _types: &[ValueType]) -> Result<ValueType> {
        Ok(ValueType::Integer)
    }

    fn add_element(&mut self, _values: &[&Value]) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &CountAggregator = downcast(other, self.name())?;
        self.count += other.count;
        Ok(())
    }

    fn emit(&self) -> Value {
        Value::Integer(self.count as i64)
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        write_u64(&mut out, self.count)
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.count = read_u64(&mut input)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Min or max over the column's natural order. Undefined rows are
/// skipped; an empty group emits Undefined.
#[derive(Debug)]
pub struct MinMaxAggregator {
    best: Option<Value>,
    is_max: bool,
}

impl MinMaxAggregator {
    pub fn min() -> MinMaxAggregator {
        MinMaxAggregator {
            best: None,
            is_max: false,
        }
    }

    pub fn max() -> MinMaxAggregator {
        MinMaxAggregator {
            best: None,
            is_max: true,
        }
    }

    fn consider(&mut self, candidate: &Value) {
        if matches!(candidate, Value::Undefined) {
            return;
        }
        let replace = match &self.best {
            None => true,
            Some(best) => {
                let ord = candidate.cmp(best);
                if self.is_max {
                    ord.is_gt()
                } else {
                    ord.is_lt()
                }
            }
        };
        if replace {
            self.best = Some(candidate.clone());
        }
    }
}

impl AggregateValue for MinMaxAggregator {
    fn name(&self) -> &'static str {
        if self.is_max {
            "max"
        } else {
            "min"
        }
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(MinMaxAggregator {
            best: None,
            is_max: self.is_max,
        })
    }

    fn support_type(&self, ty: ValueType) -> bool {
        ty.is_numeric() || ty == ValueType::DateTime
    }

    fn set_input_types(&mut self, types: &[ValueType]) -> Result<ValueType> {
        Ok(types[0])
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        self.consider(values[0]);
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &MinMaxAggregator = downcast(other, self.name())?;
        if let Some(best) = &other.best {
            self.consider(best);
        }
        Ok(())
    }

    fn emit(&self) -> Value {
        self.best.clone().unwrap_or(Value::Undefined)
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        encode_value(&mut out, &self.emit())
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.best = match decode_value(&mut input)? {
            Value::Undefined => None,
            v => Some(v),
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Arithmetic mean over defined numeric rows; always emits Float.
#[derive(Debug, Default)]
pub struct MeanAggregator {
    count: u64,
    sum: f64,
}

impl AggregateValue for MeanAggregator {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(MeanAggregator::default())
    }

    fn support_type(&self, ty: ValueType) -> bool {
        ty.is_numeric()
    }

    fn set_input_types(&mut self, _types: &[ValueType]) -> Result<ValueType> {
        Ok(ValueType::Float)
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        if let Some(x) = numeric_as_f64(values[0]) {
            self.count += 1;
            self.sum += x;
        }
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &MeanAggregator = downcast(other, self.name())?;
        self.count += other.count;
        self.sum += other.sum;
        Ok(())
    }

    fn emit(&self) -> Value {
        if self.count == 0 {
            Value::Undefined
        } else {
            Value::Float(self.sum / self.count as f64)
        }
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        write_u64(&mut out, self.count)?;
        write_u64(&mut out, self.sum.to_bits())
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.count = read_u64(&mut input)?;
        self.sum = f64::from_bits(read_u64(&mut input)?);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Population variance via Welford's online update, merged with the
/// parallel-combination formula. `stdv` is the same state emitting the
/// square root.
#[derive(Debug)]
pub struct VarianceAggregator {
    count: u64,
    mean: f64,
    m2: f64,
    emit_stdv: bool,
}

impl VarianceAggregator {
    pub fn variance() -> VarianceAggregator {
        VarianceAggregator {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            emit_stdv: false,
        }
    }

    pub fn stdv() -> VarianceAggregator {
        VarianceAggregator {
            emit_stdv: true,
            ..VarianceAggregator::variance()
        }
    }
}

impl AggregateValue for VarianceAggregator {
    fn name(&self) -> &'static str {
        if self.emit_stdv {
            "stdv"
        } else {
            "variance"
        }
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(VarianceAggregator {
            emit_stdv: self.emit_stdv,
            ..VarianceAggregator::variance()
        })
    }

    fn support_type(&self, ty: ValueType) -> bool {
        ty.is_numeric()
    }

    fn set_input_types(&mut self, _types: &[ValueType]) -> Result<ValueType> {
        Ok(ValueType::Float)
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        if let Some(x) = numeric_as_f64(values[0]) {
            self.count += 1;
            let delta = x - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (x - self.mean);
        }
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &VarianceAggregator = downcast(other, self.name())?;
        if other.count == 0 {
            return Ok(());
        }
        if self.count == 0 {
            self.count = other.count;
            self.mean = other.mean;
            self.m2 = other.m2;
            return Ok(());
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.m2 += other.m2
            + delta * delta * (self.count as f64) * (other.count as f64) / total as f64;
        self.mean += delta * other.count as f64 / total as f64;
        self.count = total;
        Ok(())
    }

    fn emit(&self) -> Value {
        if self.count == 0 {
            return Value::Undefined;
        }
        let variance = self.m2 / self.count as f64;
        if self.emit_stdv {
            Value::Float(variance.sqrt())
        } else {
            Value::Float(variance)
        }
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        write_u64(&mut out, self.count)?;
        write_u64(&mut out, self.mean.to_bits())?;
        write_u64(&mut out, self.m2.to_bits())
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.count = read_u64(&mut input)?;
        self.mean = f64::from_bits(read_u64(&mut input)?);
        self.m2 = f64::from_bits(read_u64(&mut input)?);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Number of distinct values, Undefined included.
#[derive(Debug)]
pub struct CountDistinctAggregator {
    seen: ahash::AHashSet<Value>,
}

impl Default for CountDistinctAggregator {
    fn default() -> Self {
        CountDistinctAggregator {
            seen: ahash::AHashSet::with_hasher(crate::values::map_state()),
        }
    }
}

impl AggregateValue for CountDistinctAggregator {
    fn name(&self) -> &'static str {
        "count_distinct"
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(CountDistinctAggregator::default())
    }

    fn support_type(&self, _ty: ValueType) -> bool {
        true
    }

    fn set_input_types(&mut self, _types: &[ValueType]) -> Result<ValueType> {
        Ok(ValueType::Integer)
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        if !self.seen.contains(values[0]) {
            self.seen.insert(values[0].clone());
        }
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &CountDistinctAggregator = downcast(other, self.name())?;
        for value in &other.seen {
            if !self.seen.contains(value) {
                self.seen.insert(value.clone());
            }
        }
        Ok(())
    }

    fn emit(&self) -> Value {
        Value::Integer(self.seen.len() as i64)
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        write_u64(&mut out, self.seen.len() as u64)?;
        for value in &self.seen {
            encode_value(&mut out, value)?;
        }
        Ok(())
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        let len = read_u64(&mut input)?;
        self.seen.clear();
        for _ in 0..len {
            self.seen.insert(decode_value(&mut input)?);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An arbitrary representative of the group. This implementation keeps
/// the first value it sees.
#[derive(Debug, Default)]
pub struct SelectOneAggregator {
    value: Option<Value>,
}

impl AggregateValue for SelectOneAggregator {
    fn name(&self) -> &'static str {
        "select_one"
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(SelectOneAggregator::default())
    }

    fn support_type(&self, _ty: ValueType) -> bool {
        true
    }

    fn set_input_types(&mut self, types: &[ValueType]) -> Result<ValueType> {
        Ok(types[0])
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        if self.value.is_none() {
            self.value = Some(values[0].clone());
        }
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &SelectOneAggregator = downcast(other, self.name())?;
        if self.value.is_none() {
            self.value.clone_from(&other.value);
        }
        Ok(())
    }

    fn emit(&self) -> Value {
        self.value.clone().unwrap_or(Value::Undefined)
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        match &self.value {
            Some(v) => {
                write_u64(&mut out, 1)?;
                encode_value(&mut out, v)
            }
            None => write_u64(&mut out, 0),
        }
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.value = if read_u64(&mut input)? != 0 {
            Some(decode_value(&mut input)?)
        } else {
            None
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// argmin/argmax: the value of a second column at the row where the
/// first column is minimal or maximal. Ties keep the first row seen.
#[derive(Debug)]
pub struct ArgExtremeAggregator {
    best: Option<(Value, Value)>,
    is_max: bool,
    output_type: ValueType,
}

impl ArgExtremeAggregator {
    pub fn argmin() -> ArgExtremeAggregator {
        ArgExtremeAggregator {
            best: None,
            is_max: false,
            output_type: ValueType::Integer,
        }
    }

    pub fn argmax() -> ArgExtremeAggregator {
        ArgExtremeAggregator {
            best: None,
            is_max: true,
            output_type: ValueType::Integer,
        }
    }

    fn consider(&mut self, cmp: &Value, out: &Value) {
        if matches!(cmp, Value::Undefined) {
            return;
        }
        let replace = match &self.best {
            None => true,
            Some((best, _)) => {
                let ord = cmp.cmp(best);
                if self.is_max {
                    ord.is_gt()
                } else {
                    ord.is_lt()
                }
            }
        };
        if replace {
            self.best = Some((cmp.clone(), out.clone()));
        }
    }
}

impl AggregateValue for ArgExtremeAggregator {
    fn name(&self) -> &'static str {
        if self.is_max {
            "argmax"
        } else {
            "argmin"
        }
    }

    fn new_instance(&self) -> Box<dyn AggregateValue> {
        Box::new(ArgExtremeAggregator {
            best: None,
            is_max: self.is_max,
            output_type: self.output_type,
        })
    }

    fn support_type(&self, ty: ValueType) -> bool {
        ty.is_numeric() || ty == ValueType::DateTime
    }

    fn num_input_columns(&self) -> usize {
        2
    }

    fn set_input_types(&mut self, types: &[ValueType]) -> Result<ValueType> {
        self.output_type = types[1];
        Ok(types[1])
    }

    fn add_element(&mut self, values: &[&Value]) -> Result<()> {
        self.consider(values[0], values[1]);
        Ok(())
    }

    fn combine(&mut self, other: &dyn AggregateValue) -> Result<()> {
        let other: &ArgExtremeAggregator = downcast(other, self.name())?;
        if let Some((cmp, out)) = &other.best {
            self.consider(cmp, out);
        }
        Ok(())
    }

    fn emit(&self) -> Value {
        match &self.best {
            Some((_, out)) => out.clone(),
            None => Value::Undefined,
        }
    }

    fn save(&self, mut out: &mut dyn Write) -> Result<()> {
        match &self.best {
            Some((cmp, val)) => {
                write_u64(&mut out, 1)?;
                encode_value(&mut out, cmp)?;
                encode_value(&mut out, val)
            }
            None => write_u64(&mut out, 0),
        }
    }

    fn load(&mut self, mut input: &mut dyn Read) -> Result<()> {
        self.best = if read_u64(&mut input)? != 0 {
            let cmp = decode_value(&mut input)?;
            let val = decode_value(&mut input)?;
            Some((cmp, val))
        } else {
            None
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
