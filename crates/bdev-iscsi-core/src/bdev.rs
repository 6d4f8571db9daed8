//! Block-device framework side: I/O requests handed to the adapter and the framework
//! services the adapter calls back into.

use bdev_iscsi_proto::{ScsiStatus, Sense};
use bdev_iscsi_reactor::ThreadHandle;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::{IscsiBdevError, IscsiBdevResult, IscsiLun};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoType {
    Read,
    Write,
    Flush,
    Unmap,
    Reset,
    WriteZeroes,
    Compare,
    CompareAndWrite,
    NvmeAdmin,
    NvmeIo,
    Abort,
}

/// Final status of a block I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    Failed,
    /// The target reported a non-good SCSI status; the caller interprets the sense data.
    ScsiError { status: ScsiStatus, sense: Sense },
}

impl IoStatus {
    pub fn from_scsi(status: ScsiStatus, sense: Sense) -> Self {
        if status.is_good() {
            IoStatus::Success
        } else {
            IoStatus::ScsiError { status, sense }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, IoStatus::Success)
    }
}

/// Completion of a block I/O: the final status and the request's data buffers.
pub type IoCallback = Box<dyn FnOnce(IoStatus, Vec<Vec<u8>>) + Send + 'static>;

/// Per-request scratch state kept by the adapter.
#[derive(Debug, Default)]
pub(crate) struct IoContext {
    /// Thread the request was submitted on; the completion is reported there.
    pub(crate) submit_thread: Option<ThreadHandle>,
    pub(crate) capacity_retries: u32,
}

/// A block I/O request.
///
/// The completion callback runs exactly once. A request dropped without being completed,
/// for example because its device went away underneath it, completes as
/// [`IoStatus::Failed`].
pub struct BdevIo {
    pub io_type: IoType,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    /// Data buffers. Reads without buffers get one from [`BdevFramework::get_buf`].
    pub iovs: Vec<Vec<u8>>,
    pub(crate) ctx: IoContext,
    cb: Option<IoCallback>,
}

impl BdevIo {
    pub fn new<F>(io_type: IoType, offset_blocks: u64, num_blocks: u64, cb: F) -> Self
    where
        F: FnOnce(IoStatus, Vec<Vec<u8>>) + Send + 'static,
    {
        Self {
            io_type,
            offset_blocks,
            num_blocks,
            iovs: Vec::new(),
            ctx: IoContext::default(),
            cb: Some(Box::new(cb)),
        }
    }

    pub fn with_iovs(mut self, iovs: Vec<Vec<u8>>) -> Self {
        self.iovs = iovs;
        self
    }

    pub fn capacity_retries(&self) -> u32 {
        self.ctx.capacity_retries
    }

    pub(crate) fn iov_len(&self) -> usize {
        self.iovs.iter().map(Vec::len).sum()
    }

    /// Run the completion callback on the calling thread.
    pub(crate) fn complete(mut self, status: IoStatus) {
        if let Some(cb) = self.cb.take() {
            cb(status, std::mem::take(&mut self.iovs));
        }
    }
}

impl Drop for BdevIo {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            warn!(
                io_type = ?self.io_type,
                offset_blocks = self.offset_blocks,
                num_blocks = self.num_blocks,
                "block io dropped before completion"
            );
            cb(IoStatus::Failed, std::mem::take(&mut self.iovs));
        }
    }
}

impl fmt::Debug for BdevIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BdevIo")
            .field("io_type", &self.io_type)
            .field("offset_blocks", &self.offset_blocks)
            .field("num_blocks", &self.num_blocks)
            .field("iovs", &self.iovs.len())
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Callback for device deletion.
pub type UnregisterCallback = Box<dyn FnOnce(IscsiBdevResult<()>) + Send + 'static>;

/// Services provided by the generic block-device layer.
pub trait BdevFramework: Send + Sync {
    /// Publish a new device. On error the device is discarded.
    fn register(&self, lun: Arc<IscsiLun>) -> IscsiBdevResult<()>;

    /// Start removing the device called `name`. The framework calls
    /// [`IscsiLun::destruct`] and runs `done` once the device reports
    /// [`BdevFramework::destruct_done`]. An unknown name hands `done` back with the error.
    fn unregister(
        &self,
        name: &str,
        done: UnregisterCallback,
    ) -> Result<(), (IscsiBdevError, UnregisterCallback)>;

    /// Acquire a data buffer of `len` bytes for a read.
    fn get_buf(&self, len: usize) -> Option<Vec<u8>> {
        Some(vec![0u8; len])
    }

    /// The device grew to `block_count` blocks.
    fn notify_blockcnt_change(&self, name: &str, block_count: u64) -> IscsiBdevResult<()>;

    /// Asynchronous teardown of the device finished.
    fn destruct_done(&self, name: &str, result: IscsiBdevResult<()>);
}
