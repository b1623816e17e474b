pub mod attribute;
pub mod dimension;
pub mod domain;
pub mod schema;

pub use attribute::Attribute;
pub use dimension::{Dimension, DimensionConstraints};
pub use domain::{Domain, DomainView, Overlap};
pub use schema::{ArraySchema, SchemaError};
