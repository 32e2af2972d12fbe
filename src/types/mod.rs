pub mod domain;
pub mod request;
pub mod usage;
pub use domain::*;
pub use request::*;
pub use usage::*;
