//! Block device adapter that exposes remote iSCSI logical units as local block devices.
//!
//! Devices are created through [`IscsiBdevModule::create_disk`], which logs in to the target,
//! probes provisioning support, block limits and capacity, and then publishes an
//! [`IscsiLun`] to the [`BdevFramework`]. Consumers open an [`IscsiChannel`] per reactor
//! thread and submit [`BdevIo`] requests through it. The network protocol itself sits
//! behind [`IscsiSession`].

mod bdev;
mod config;
mod conn;
mod discovery;
mod dispatch;
mod error;
mod iscsi_url;
mod lun;
mod module;
mod session;

pub use bdev::{BdevFramework, BdevIo, IoCallback, IoStatus, IoType, UnregisterCallback};
pub use config::{
    CREATE_METHOD, ConfigEntry, CreateDiskParams, DriverInfo, IscsiBdevConfig, IscsiInfo,
};
pub use discovery::{Discovery, DiscoveryState, LunGeometry, Progress};
pub use dispatch::split_unmap;
pub use error::{IscsiBdevError, IscsiBdevErrorKind, IscsiBdevResult};
pub use iscsi_url::{DEFAULT_ISCSI_PORT, IscsiUrl};
pub use lun::{IscsiChannel, IscsiLun, LunIdentity, PRODUCT_NAME};
pub use module::IscsiBdevModule;
pub use session::{
    DataTransfer, HeaderDigest, IscsiSession, PollEvents, RejectedTransfer, SessionError,
    SessionErrorKind, SessionFactory, SessionResult, SessionType, TaskCompletion, TaskPayload,
    TaskTag,
};
