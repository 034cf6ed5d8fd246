//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods
//! that accept `&PgPool` as the first argument.

pub mod device_info_repo;
pub mod device_online_repo;

pub use device_info_repo::DeviceInfoRepo;
pub use device_online_repo::DeviceOnlineRepo;
