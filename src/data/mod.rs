pub mod bindings;
pub mod object;
pub mod value;

pub use bindings::{Bindings, Bound, BoundKind};
pub use object::{EntityCache, EntityObject, IdentityMap};
pub use value::{ScalarKind, Value};
