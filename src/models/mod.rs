pub mod limit_value;
pub mod usage_limits;
pub mod usage;
pub mod subscription;
pub mod compliance;

pub use limit_value::*;
pub use usage_limits::*;
pub use usage::*;
pub use subscription::*;
pub use compliance::*;
