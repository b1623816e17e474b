use std::collections::HashSet;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::ops::{BitAnd, BitOr, Not};

use thiserror::Error;

use tessera_common::datatype::physical::{BitsEq, BitsOrd};
use tessera_common::datatype::{Datatype, PhysicalType};
use tessera_common::physical_type_go;

use crate::tile::Tile;

#[derive(Clone, Debug, Error)]
pub enum ConditionError {
    #[error("Condition references unknown field '{0}'")]
    UnknownField(String),
    #[error("Literal {literal} cannot compare against field '{field}' of type {datatype}")]
    TypeMismatch {
        field: String,
        datatype: Datatype,
        literal: Literal,
    },
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EqualityOp {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    Greater,
}

impl Display for EqualityOp {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Self::Less => write!(f, "<"),
            Self::LessEqual => write!(f, "<="),
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "<>"),
            Self::GreaterEqual => write!(f, ">="),
            Self::Greater => write!(f, ">"),
        }
    }
}

impl Not for EqualityOp {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            Self::Less => Self::GreaterEqual,
            Self::LessEqual => Self::Greater,
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::GreaterEqual => Self::Less,
            Self::Greater => Self::LessEqual,
        }
    }
}

impl EqualityOp {
    fn matches(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Less => ordering == Less,
            Self::LessEqual => ordering != Greater,
            Self::Equal => ordering == Equal,
            Self::NotEqual => ordering != Equal,
            Self::GreaterEqual => ordering != Less,
            Self::Greater => ordering == Greater,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CombinationOp {
    And,
    Or,
}

impl Display for CombinationOp {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
}

macro_rules! literal_from_impls {
    ($($V:ident : $U:ty),+) => {
        $(
            impl From<$U> for Literal {
                fn from(value: $U) -> Self {
                    Literal::$V(value)
                }
            }
        )+
    }
}

literal_from_impls!(UInt8: u8, UInt16: u16, UInt32: u32, UInt64: u64);
literal_from_impls!(Int8: i8, Int16: i16, Int32: i32, Int64: i64);
literal_from_impls!(Float32: f32, Float64: f64, String: String);

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::String(value.to_owned())
    }
}

impl Literal {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Literal::UInt8(v) => v.to_le_bytes().to_vec(),
            Literal::UInt16(v) => v.to_le_bytes().to_vec(),
            Literal::UInt32(v) => v.to_le_bytes().to_vec(),
            Literal::UInt64(v) => v.to_le_bytes().to_vec(),
            Literal::Int8(v) => v.to_le_bytes().to_vec(),
            Literal::Int16(v) => v.to_le_bytes().to_vec(),
            Literal::Int32(v) => v.to_le_bytes().to_vec(),
            Literal::Int64(v) => v.to_le_bytes().to_vec(),
            Literal::Float32(v) => v.to_le_bytes().to_vec(),
            Literal::Float64(v) => v.to_le_bytes().to_vec(),
            Literal::String(v) => v.as_bytes().to_vec(),
        }
    }

    /// The literal's value as `T`, when the physical types agree exactly.
    fn typed_value<T: PhysicalType>(&self) -> Option<T> {
        let bytes = self.to_bytes();
        let matches = match self {
            Literal::UInt8(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<u8>(),
            Literal::UInt16(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<u16>(),
            Literal::UInt32(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<u32>(),
            Literal::UInt64(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<u64>(),
            Literal::Int8(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<i8>(),
            Literal::Int16(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<i16>(),
            Literal::Int32(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<i32>(),
            Literal::Int64(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<i64>(),
            Literal::Float32(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<f32>(),
            Literal::Float64(_) => std::any::TypeId::of::<T>() == std::any::TypeId::of::<f64>(),
            Literal::String(_) => false,
        };
        matches.then(|| T::read_le(&bytes))
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Literal::UInt8(v) => write!(f, "{v}"),
            Literal::UInt16(v) => write!(f, "{v}"),
            Literal::UInt32(v) => write!(f, "{v}"),
            Literal::UInt64(v) => write!(f, "{v}"),
            Literal::Int8(v) => write!(f, "{v}"),
            Literal::Int16(v) => write!(f, "{v}"),
            Literal::Int32(v) => write!(f, "{v}"),
            Literal::Int64(v) => write!(f, "{v}"),
            Literal::Float32(v) => write!(f, "{v}"),
            Literal::Float64(v) => write!(f, "{v}"),
            Literal::String(v) => write!(f, "'{v}'"),
        }
    }
}

/// A predicate tree over attribute values, evaluated per tile into a
/// survival bitmap. The evaluator is pure; disjoint tiles may be evaluated
/// concurrently.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryCondition {
    Value {
        field: String,
        op: EqualityOp,
        literal: Literal,
    },
    Combination {
        lhs: Box<QueryCondition>,
        op: CombinationOp,
        rhs: Box<QueryCondition>,
    },
    Negate(Box<QueryCondition>),
}

impl QueryCondition {
    pub fn value<F, L>(field: F, op: EqualityOp, literal: L) -> Self
    where
        F: Into<String>,
        L: Into<Literal>,
    {
        QueryCondition::Value {
            field: field.into(),
            op,
            literal: literal.into(),
        }
    }

    /// Every field name the tree references.
    pub fn fields(&self) -> HashSet<&str> {
        let mut out = HashSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut HashSet<&'a str>) {
        match self {
            QueryCondition::Value { field, .. } => {
                out.insert(field.as_str());
            }
            QueryCondition::Combination { lhs, rhs, .. } => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            QueryCondition::Negate(inner) => inner.collect_fields(out),
        }
    }

    /// Evaluates the tree over one tile's field buffers, producing one byte
    /// per cell (1 = survives).
    pub fn evaluate<'a, F>(&self, tile_of: &F, cell_num: u64) -> Result<Vec<u8>, ConditionError>
    where
        F: Fn(&str) -> Option<&'a Tile>,
    {
        match self {
            QueryCondition::Value { field, op, literal } => {
                let tile = tile_of(field)
                    .ok_or_else(|| ConditionError::UnknownField(field.clone()))?;
                evaluate_value(field, *op, literal, tile, cell_num)
            }
            QueryCondition::Combination { lhs, op, rhs } => {
                let l = lhs.evaluate(tile_of, cell_num)?;
                let r = rhs.evaluate(tile_of, cell_num)?;
                Ok(l.iter()
                    .zip(r.iter())
                    .map(|(a, b)| match op {
                        CombinationOp::And => a & b,
                        CombinationOp::Or => a | b,
                    })
                    .collect())
            }
            QueryCondition::Negate(inner) => {
                let mut bitmap = inner.evaluate(tile_of, cell_num)?;
                for b in bitmap.iter_mut() {
                    *b = 1 - *b;
                }
                Ok(bitmap)
            }
        }
    }

    /// As [Self::evaluate] but producing a running-count bitmap, the shape
    /// used when one output cell aggregates several source ranges.
    pub fn evaluate_count<'a, F>(
        &self,
        tile_of: &F,
        cell_num: u64,
    ) -> Result<Vec<u64>, ConditionError>
    where
        F: Fn(&str) -> Option<&'a Tile>,
    {
        Ok(self
            .evaluate(tile_of, cell_num)?
            .into_iter()
            .map(u64::from)
            .collect())
    }
}

fn evaluate_value(
    field: &str,
    op: EqualityOp,
    literal: &Literal,
    tile: &Tile,
    cell_num: u64,
) -> Result<Vec<u8>, ConditionError> {
    debug_assert_eq!(cell_num, tile.cell_num());

    let mismatch = || ConditionError::TypeMismatch {
        field: field.to_owned(),
        datatype: tile.datatype(),
        literal: literal.clone(),
    };

    // var-sized and multi-value cells compare bytewise over the full value
    let bytewise = tile.is_var() || tile.cell_size() != tile.datatype().size() as u64;
    if bytewise {
        let needle = literal.to_bytes();
        return Ok((0..cell_num)
            .map(|pos| {
                // a null cell fails every comparison
                if tile.validity(pos) == 0 {
                    return 0;
                }
                u8::from(op.matches(tile.get(pos).cmp(&needle.as_slice())))
            })
            .collect());
    }

    physical_type_go!(tile.datatype(), DT, {
        let needle = literal.typed_value::<DT>().ok_or_else(mismatch)?;
        Ok((0..cell_num)
            .map(|pos| {
                if tile.validity(pos) == 0 {
                    return 0;
                }
                let value = DT::read_le(tile.get(pos));
                u8::from(op.matches(value.bits_cmp(&needle)))
            })
            .collect())
    })
}

impl BitAnd for QueryCondition {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        QueryCondition::Combination {
            lhs: Box::new(self),
            op: CombinationOp::And,
            rhs: Box::new(rhs),
        }
    }
}

impl BitOr for QueryCondition {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        QueryCondition::Combination {
            lhs: Box::new(self),
            op: CombinationOp::Or,
            rhs: Box::new(rhs),
        }
    }
}

impl Not for QueryCondition {
    type Output = Self;

    fn not(self) -> Self::Output {
        QueryCondition::Negate(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_tile(values: &[i32]) -> Tile {
        let mut tile = Tile::fixed(Datatype::Int32, 4, false);
        for v in values {
            tile.append(&v.to_le_bytes(), None);
        }
        tile
    }

    #[test]
    fn value_node_ops() {
        let tile = int_tile(&[1, 5, 9]);
        let lookup = |name: &str| (name == "a").then_some(&tile);

        let qc = QueryCondition::value("a", EqualityOp::Greater, 4i32);
        assert_eq!(vec![0, 1, 1], qc.evaluate(&lookup, 3).unwrap());

        let qc = QueryCondition::value("a", EqualityOp::Equal, 5i32);
        assert_eq!(vec![0, 1, 0], qc.evaluate(&lookup, 3).unwrap());
    }

    #[test]
    fn combinations_fold() {
        let tile = int_tile(&[1, 5, 9]);
        let lookup = |name: &str| (name == "a").then_some(&tile);

        let qc = QueryCondition::value("a", EqualityOp::Greater, 2i32)
            & QueryCondition::value("a", EqualityOp::Less, 9i32);
        assert_eq!(vec![0, 1, 0], qc.evaluate(&lookup, 3).unwrap());

        let qc = QueryCondition::value("a", EqualityOp::Less, 2i32)
            | QueryCondition::value("a", EqualityOp::Greater, 8i32);
        assert_eq!(vec![1, 0, 1], qc.evaluate(&lookup, 3).unwrap());

        let qc = !QueryCondition::value("a", EqualityOp::Equal, 5i32);
        assert_eq!(vec![1, 0, 1], qc.evaluate(&lookup, 3).unwrap());
    }

    #[test]
    fn null_cells_fail_everything() {
        let mut tile = Tile::fixed(Datatype::Int32, 4, true);
        tile.append(&5i32.to_le_bytes(), Some(1));
        tile.append(&5i32.to_le_bytes(), Some(0));
        let lookup = |name: &str| (name == "a").then_some(&tile);

        let qc = QueryCondition::value("a", EqualityOp::Equal, 5i32);
        assert_eq!(vec![1, 0], qc.evaluate(&lookup, 2).unwrap());
        let qc = QueryCondition::value("a", EqualityOp::NotEqual, 7i32);
        assert_eq!(vec![1, 0], qc.evaluate(&lookup, 2).unwrap());
    }

    #[test]
    fn var_values_compare_bytewise() {
        let mut tile = Tile::var(Datatype::Char, false);
        for v in [b"apple".as_slice(), b"kiwi", b"fig"] {
            tile.append(v, None);
        }
        let lookup = |name: &str| (name == "v").then_some(&tile);

        let qc = QueryCondition::value("v", EqualityOp::Equal, "kiwi");
        assert_eq!(vec![0, 1, 0], qc.evaluate(&lookup, 3).unwrap());
        let qc = QueryCondition::value("v", EqualityOp::Less, "kiwi");
        assert_eq!(vec![1, 0, 1], qc.evaluate(&lookup, 3).unwrap());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let tile = int_tile(&[1]);
        let lookup = |name: &str| (name == "a").then_some(&tile);
        let qc = QueryCondition::value("a", EqualityOp::Equal, 1i64);
        assert!(qc.evaluate(&lookup, 1).is_err());
    }

    #[test]
    fn fields_are_collected() {
        let qc = QueryCondition::value("a", EqualityOp::Equal, 1i32)
            & (QueryCondition::value("b", EqualityOp::Less, 2i32)
                | QueryCondition::value("a", EqualityOp::Greater, 0i32));
        let fields = qc.fields();
        assert_eq!(2, fields.len());
        assert!(fields.contains("a") && fields.contains("b"));
    }
}
