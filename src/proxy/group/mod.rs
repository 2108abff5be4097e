pub mod set;

pub use set::{NodeResolver, SetOutbound, DEFAULT_SET_TIMEOUT};
