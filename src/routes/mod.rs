pub mod subscription;
pub mod usage;
pub mod usage_limits;
