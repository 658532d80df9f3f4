#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

mod field_type;
pub(crate) mod query;
mod schema;

pub use field_type::FieldType;
pub(crate) use field_type::InvalidValue;
pub(crate) use query::Query;
pub(crate) use query::TYPENAME;
pub use schema::Schema;
