//! Translation of block I/O into SCSI tasks and of task completions back into I/O status.

use bdev_iscsi_proto::{ReadCapacity16, TmfResponse, UnmapDescriptor};
use bdev_iscsi_reactor::ThreadHandle;
use std::sync::Arc;
use tracing::{error, trace, warn};

use crate::bdev::{BdevIo, IoStatus, IoType};
use crate::lun::Task;
use crate::session::{
    DataTransfer, IscsiSession, SessionError, SessionErrorKind, TaskCompletion, TaskPayload,
    TaskTag,
};
use crate::IscsiLun;

/// Split `[lba, lba + num_blocks)` into UNMAP descriptors of at most `max_unmap` blocks.
/// Returns `None` when more than `max_descriptors` would be needed.
pub fn split_unmap(
    lba: u64,
    num_blocks: u64,
    max_unmap: u32,
    max_descriptors: u32,
) -> Option<Vec<UnmapDescriptor>> {
    if max_unmap == 0 {
        return None;
    }
    let per_descriptor = u64::from(max_unmap);
    if num_blocks.div_ceil(per_descriptor) > u64::from(max_descriptors) {
        return None;
    }
    let mut descriptors = Vec::new();
    let mut offset = lba;
    let mut remaining = num_blocks;
    loop {
        let blocks = remaining.min(per_descriptor);
        // `blocks` never exceeds `max_unmap`, a u32.
        descriptors.push(UnmapDescriptor::new(offset, blocks as u32));
        remaining -= blocks;
        offset += blocks;
        if remaining == 0 {
            break;
        }
    }
    Some(descriptors)
}

impl IscsiLun {
    /// Entry point for I/O submitted from `from`. Requests from a thread other than the
    /// owner are forwarded to the owner. The completion always travels back to `from`, also
    /// when the session ends up serviced elsewhere after the channels close.
    pub(crate) fn submit_request(self: &Arc<Self>, from: &ThreadHandle, mut io: BdevIo) {
        io.ctx.submit_thread = Some(from.clone());
        match self.owner() {
            Some(owner) if owner != *from => self.forward(&owner, io),
            Some(_) => self.dispatch(io),
            None => {
                error!(bdev = %self.name(), "io submitted without an open channel");
                io.complete(IoStatus::Failed);
            }
        }
    }

    fn forward(self: &Arc<Self>, owner: &ThreadHandle, io: BdevIo) {
        let lun = Arc::clone(self);
        if let Err(err) = owner.send_msg(move || lun.dispatch(io)) {
            // The message, and with it the request, is dropped; dropping fails the request.
            error!(bdev = %self.name(), error = %err, "failed to forward io to owner thread");
        }
    }

    /// Issue `io` against the session. Runs on the owner thread.
    fn dispatch(self: &Arc<Self>, io: BdevIo) {
        trace!(
            bdev = %self.name(),
            io_type = ?io.io_type,
            offset_blocks = io.offset_blocks,
            num_blocks = io.num_blocks,
            "dispatch"
        );
        match io.io_type {
            IoType::Read => self.read(io),
            IoType::Write => self.write(io),
            IoType::Flush => self.flush(io),
            IoType::Unmap => self.unmap(io),
            IoType::Reset => self.reset(io),
            _ => self.complete_io(io, IoStatus::Failed),
        }
    }

    fn transfer_len(&self, io: &BdevIo) -> Option<u32> {
        io.num_blocks
            .checked_mul(u64::from(self.block_len()))
            .and_then(|len| u32::try_from(len).ok())
    }

    fn read(self: &Arc<Self>, mut io: BdevIo) {
        let Some(len) = self.transfer_len(&io) else {
            error!(bdev = %self.name(), num_blocks = io.num_blocks, "read too large");
            return self.complete_io(io, IoStatus::Failed);
        };
        if io.iov_len() < len as usize {
            match self.framework.get_buf(len as usize) {
                Some(buf) => io.iovs = vec![buf],
                None => {
                    error!(bdev = %self.name(), len, "failed to get read buffer");
                    return self.complete_io(io, IoStatus::Failed);
                }
            }
        }
        let (lun, block_len) = (self.lun_id(), self.block_len());
        self.issue(io, Task::Command, move |session, tag, io| {
            let transfer = DataTransfer {
                lun,
                lba: io.offset_blocks,
                len,
                block_len,
                buffers: std::mem::take(&mut io.iovs),
            };
            session.read16(transfer, tag).map_err(|rejected| {
                io.iovs = rejected.buffers;
                rejected.error
            })
        });
    }

    fn write(self: &Arc<Self>, io: BdevIo) {
        let Some(len) = self.transfer_len(&io) else {
            error!(bdev = %self.name(), num_blocks = io.num_blocks, "write too large");
            return self.complete_io(io, IoStatus::Failed);
        };
        let (lun, block_len) = (self.lun_id(), self.block_len());
        self.issue(io, Task::Command, move |session, tag, io| {
            let transfer = DataTransfer {
                lun,
                lba: io.offset_blocks,
                len,
                block_len,
                buffers: std::mem::take(&mut io.iovs),
            };
            session.write16(transfer, tag).map_err(|rejected| {
                io.iovs = rejected.buffers;
                rejected.error
            })
        });
    }

    fn flush(self: &Arc<Self>, io: BdevIo) {
        let lun = self.lun_id();
        // Zero blocks syncs to the end of the medium.
        let num_blocks = u32::try_from(io.num_blocks).unwrap_or(0);
        self.issue(io, Task::Command, move |session, tag, io| {
            session.synchronizecache16(lun, io.offset_blocks, num_blocks, tag)
        });
    }

    fn unmap(self: &Arc<Self>, io: BdevIo) {
        let Some(descriptors) = split_unmap(
            io.offset_blocks,
            io.num_blocks,
            self.max_unmap(),
            self.config.max_unmap_block_descriptors,
        ) else {
            error!(
                bdev = %self.name(),
                num_blocks = io.num_blocks,
                max_unmap = self.max_unmap(),
                "too many unmap entries"
            );
            return self.complete_io(io, IoStatus::Failed);
        };
        let lun = self.lun_id();
        self.issue(io, Task::Command, move |session, tag, _| {
            session.unmap(lun, &descriptors, tag)
        });
    }

    /// Resets always run on the owner thread, even when submitted there.
    fn reset(self: &Arc<Self>, io: BdevIo) {
        let Some(owner) = self.owner() else {
            error!(bdev = %self.name(), "reset without an owner thread");
            return self.complete_io(io, IoStatus::Failed);
        };
        let lun = Arc::clone(self);
        if let Err(err) = owner.send_msg(move || lun.reset_on_owner(io)) {
            error!(bdev = %self.name(), error = %err, "failed to forward reset to owner thread");
        }
    }

    fn reset_on_owner(self: &Arc<Self>, io: BdevIo) {
        let lun = self.lun_id();
        self.issue(io, Task::Reset, move |session, tag, _| {
            session.task_mgmt_lun_reset(lun, tag)
        });
    }

    /// Queue a task for `io`. When the session refuses it the I/O fails immediately.
    fn issue<F>(self: &Arc<Self>, mut io: BdevIo, task: fn(BdevIo) -> Task, submit: F)
    where
        F: FnOnce(&mut dyn IscsiSession, TaskTag, &mut BdevIo) -> Result<(), SessionError>,
    {
        let rejected = {
            let mut slot = self.lock_session();
            let tag = slot.next_tag();
            let result = match slot.session.as_deref_mut() {
                Some(session) => submit(session, tag, &mut io),
                None => Err(SessionError::with_message(
                    SessionErrorKind::NotConnected,
                    "session closed",
                )),
            };
            match result {
                Ok(()) => {
                    slot.inflight.insert(tag, task(io));
                    None
                }
                Err(err) => Some((io, err)),
            }
        };
        if let Some((io, err)) = rejected {
            error!(
                bdev = %self.name(),
                io_type = ?io.io_type,
                error = %err,
                "failed to issue task"
            );
            self.complete_io(io, IoStatus::Failed);
        }
    }

    /// Handle a finished task on the thread that serviced the session.
    pub(crate) fn task_done(self: &Arc<Self>, task: Task, completion: TaskCompletion) {
        match task {
            Task::Command(io) => self.command_done(io, completion),
            Task::Reset(io) => {
                let status = match completion.payload {
                    TaskPayload::TmfResponse(raw) => match TmfResponse::try_from(raw) {
                        Ok(TmfResponse::Complete) => IoStatus::Success,
                        response => {
                            warn!(bdev = %self.name(), ?response, "lun reset not complete");
                            IoStatus::Failed
                        }
                    },
                    _ => IoStatus::Failed,
                };
                self.complete_io(io, status);
            }
            Task::CapacityRefresh => self.capacity_refreshed(completion),
        }
    }

    fn command_done(self: &Arc<Self>, mut io: BdevIo, completion: TaskCompletion) {
        let capacity_changed = completion.is_capacity_changed();
        if let TaskPayload::Buffers(buffers) = completion.payload {
            io.iovs = buffers;
        }
        if capacity_changed && io.ctx.capacity_retries < self.config.max_capacity_change_retries
        {
            io.ctx.capacity_retries += 1;
            warn!(
                bdev = %self.name(),
                io_type = ?io.io_type,
                attempt = io.ctx.capacity_retries,
                "capacity data changed, refreshing capacity and retrying"
            );
            self.refresh_capacity();
            self.resubmit(io);
            return;
        }
        let status = IoStatus::from_scsi(completion.status, completion.sense);
        self.complete_io(io, status);
    }

    /// Retry after a capacity change, keeping the original submitter for the completion.
    fn resubmit(self: &Arc<Self>, io: BdevIo) {
        match self.owner() {
            Some(owner) if !owner.is_current() => self.forward(&owner, io),
            _ => self.dispatch(io),
        }
    }

    fn refresh_capacity(&self) {
        let mut slot = self.lock_session();
        let tag = slot.next_tag();
        let lun = self.lun_id();
        let Some(session) = slot.session.as_deref_mut() else {
            return;
        };
        match session.readcapacity16(lun, tag) {
            Ok(()) => {
                slot.inflight.insert(tag, Task::CapacityRefresh);
            }
            Err(err) => {
                error!(bdev = %self.name(), error = %err, "failed to issue readcapacity16");
            }
        }
    }

    fn capacity_refreshed(&self, completion: TaskCompletion) {
        if !completion.is_good() {
            error!(bdev = %self.name(), status = %completion.status, "readcapacity16 failed");
            return;
        }
        let TaskPayload::DataIn(data) = &completion.payload else {
            error!(bdev = %self.name(), "readcapacity16 returned no data");
            return;
        };
        let new_count = match ReadCapacity16::decode(data).map(|cap| cap.num_blocks()) {
            Ok(Some(count)) => count,
            Ok(None) => {
                error!(bdev = %self.name(), "readcapacity16 block count overflows");
                return;
            }
            Err(err) => {
                error!(bdev = %self.name(), error = %err, "read capacity error");
                return;
            }
        };
        if let Err(err) = self.resize(new_count) {
            error!(bdev = %self.name(), error = %err, "bdev resize error");
        }
    }

    /// Report `status` on the submitting thread, hopping there when completing elsewhere.
    fn complete_io(&self, mut io: BdevIo, status: IoStatus) {
        match io.ctx.submit_thread.take() {
            Some(thread) if !thread.is_current() => {
                if let Err(err) = thread.send_msg(move || io.complete(status)) {
                    error!(bdev = %self.name(), error = %err, "failed to return io to submitter");
                }
            }
            _ => io.complete(status),
        }
    }
}
