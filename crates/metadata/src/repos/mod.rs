//! Repository traits for metadata operations.

pub mod base_resource_types;
pub mod builds;
pub mod containers;
pub mod gc;
pub mod locks;
pub mod resource_caches;
pub mod resource_configs;
pub mod volumes;
pub mod worker_resource_caches;
pub mod workers;

pub use base_resource_types::BaseResourceTypeRepo;
pub use builds::BuildRepo;
pub use containers::{ContainerOwner, ContainerRepo};
pub use gc::GcRepo;
pub use locks::{scope_checking_lock_name, LockRepo};
pub use resource_caches::{ResourceCacheChain, ResourceCacheDescriptor, ResourceCacheRepo, ResourceCacheUser};
pub use resource_configs::{NewVersion, ResourceConfigDescriptor, ResourceConfigRepo};
pub use volumes::VolumeRepo;
pub use worker_resource_caches::WorkerResourceCacheRepo;
pub use workers::{WorkerRepo, WorkerResourceTypeSpec};
