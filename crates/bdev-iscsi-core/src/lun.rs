use bdev_iscsi_reactor::{
    PollStatus, PollerHandle, ThreadHandle, current, register_poller,
};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, error, info, warn};

use crate::bdev::{BdevFramework, BdevIo, IoType};
use crate::config::{ConfigEntry, CreateDiskParams, DriverInfo, IscsiInfo};
use crate::discovery::LunGeometry;
use crate::session::{IscsiSession, TaskCompletion, TaskTag};
use crate::{IscsiBdevConfig, IscsiBdevError, IscsiBdevErrorKind, IscsiBdevResult};

pub const PRODUCT_NAME: &str = "iSCSI LUN";

/// Identity of a device being created.
#[derive(Clone, Debug)]
pub struct LunIdentity {
    pub name: String,
    pub url: String,
    pub initiator_iqn: String,
}

/// Work the session is carrying on behalf of this device.
pub(crate) enum Task {
    /// Read, write, flush or unmap.
    Command(BdevIo),
    Reset(BdevIo),
    /// Capacity query triggered by a capacity-changed unit attention.
    CapacityRefresh,
}

pub(crate) struct SessionSlot {
    pub(crate) session: Option<Box<dyn IscsiSession>>,
    pub(crate) inflight: HashMap<TaskTag, Task>,
    next_tag: u64,
}

impl SessionSlot {
    pub(crate) fn next_tag(&mut self) -> TaskTag {
        let tag = TaskTag(self.next_tag);
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }
}

/// Which poller is asking to drive the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PollRole {
    /// Owner thread's poller, alive while channels are open.
    Active,
    /// Poller on the creating thread, used while no channel is open.
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Teardown {
    Live,
    /// Destruct requested, the fallback thread has not picked it up yet.
    Stopping,
    /// Waiting for the remaining channels to close and in-flight tasks to complete. The
    /// fallback poller keeps servicing the session meanwhile.
    Draining,
    Freed,
}

struct LunState {
    ch_count: u32,
    owner: Option<ThreadHandle>,
    active_poller: Option<PollerHandle>,
    fallback_thread: ThreadHandle,
    fallback_poller: Option<PollerHandle>,
    teardown: Teardown,
}

impl LunState {
    /// The poller allowed to touch the session given the current channel count.
    fn poll_role(&self) -> PollRole {
        if self.ch_count == 0 {
            PollRole::Fallback
        } else {
            PollRole::Active
        }
    }
}

/// One exposed iSCSI logical unit.
///
/// The session is driven by exactly one thread at a time: the owner thread while at least
/// one [`IscsiChannel`] is open, otherwise the thread that created the device.
pub struct IscsiLun {
    identity: LunIdentity,
    lun_id: u32,
    block_len: u32,
    phys_block_len: u32,
    block_count: AtomicU64,
    /// Serializes resizes so the framework sees block counts in increasing order.
    resize_lock: Mutex<()>,
    unmap_supported: bool,
    max_unmap: u32,
    pub(crate) config: Arc<IscsiBdevConfig>,
    pub(crate) framework: Arc<dyn BdevFramework>,
    pub(crate) session: Mutex<SessionSlot>,
    state: Mutex<LunState>,
}

impl IscsiLun {
    /// Build the device from a finished discovery and publish it. Must run on a reactor,
    /// which becomes the fallback polling thread.
    pub(crate) fn create(
        identity: LunIdentity,
        geometry: LunGeometry,
        session: Box<dyn IscsiSession>,
        config: Arc<IscsiBdevConfig>,
        framework: Arc<dyn BdevFramework>,
    ) -> IscsiBdevResult<Arc<Self>> {
        let fallback_thread = current().ok_or_else(|| {
            IscsiBdevError::with_message(
                IscsiBdevErrorKind::Reactor,
                "device creation must run on a reactor",
            )
        })?;
        let idle_interval = config.idle_poll_interval();
        let lun = Arc::new(Self {
            identity,
            lun_id: geometry.lun,
            block_len: geometry.block_len,
            phys_block_len: geometry.phys_block_len,
            block_count: AtomicU64::new(geometry.num_blocks),
            resize_lock: Mutex::new(()),
            unmap_supported: geometry.unmap_supported,
            max_unmap: if geometry.unmap_supported {
                geometry.max_unmap.max(1)
            } else {
                0
            },
            config,
            framework,
            session: Mutex::new(SessionSlot {
                session: Some(session),
                inflight: HashMap::new(),
                next_tag: 1,
            }),
            state: Mutex::new(LunState {
                ch_count: 0,
                owner: None,
                active_poller: None,
                fallback_thread,
                fallback_poller: None,
                teardown: Teardown::Live,
            }),
        });

        let poll_lun = Arc::clone(&lun);
        let fallback = register_poller("iscsi_lun_idle", idle_interval, move || {
            poll_lun.poll_tick(PollRole::Fallback)
        })?;
        if let Err(err) = lun.framework.register(Arc::clone(&lun)) {
            error!(bdev = %lun.name(), error = %err, "bdev registration failed");
            if let Err(err) = fallback.unregister() {
                warn!(bdev = %lun.name(), error = %err, "failed to stop fallback poller");
            }
            return Err(err);
        }
        lun.lock_state().fallback_poller = Some(fallback);
        info!(
            bdev = %lun.name(),
            url = %lun.url(),
            lun = lun.lun_id,
            blockcnt = geometry.num_blocks,
            blocklen = geometry.block_len,
            unmap = lun.unmap_supported,
            "iscsi bdev registered"
        );
        Ok(lun)
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn url(&self) -> &str {
        &self.identity.url
    }

    pub fn initiator_iqn(&self) -> &str {
        &self.identity.initiator_iqn
    }

    pub fn product_name(&self) -> &'static str {
        PRODUCT_NAME
    }

    pub fn lun_id(&self) -> u32 {
        self.lun_id
    }

    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    pub fn phys_block_len(&self) -> u32 {
        self.phys_block_len
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Acquire)
    }

    pub fn unmap_supported(&self) -> bool {
        self.unmap_supported
    }

    /// Blocks per UNMAP descriptor, zero when unmap is unsupported.
    pub fn max_unmap(&self) -> u32 {
        self.max_unmap
    }

    pub fn max_unmap_segments(&self) -> u32 {
        if self.unmap_supported {
            self.config.max_unmap_block_descriptors
        } else {
            0
        }
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        match io_type {
            IoType::Read | IoType::Write | IoType::Flush | IoType::Reset => true,
            IoType::Unmap => self.unmap_supported,
            _ => false,
        }
    }

    pub fn channel_count(&self) -> u32 {
        self.lock_state().ch_count
    }

    /// Thread currently owning the session, if any channel is open.
    pub fn owner(&self) -> Option<ThreadHandle> {
        self.lock_state().owner.clone()
    }

    pub fn is_freed(&self) -> bool {
        self.lock_state().teardown == Teardown::Freed
    }

    pub fn dump_info(&self) -> DriverInfo {
        DriverInfo {
            iscsi: IscsiInfo {
                initiator_name: self.initiator_iqn().to_string(),
                url: self.url().to_string(),
            },
        }
    }

    pub fn dump_info_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.dump_info())
    }

    /// Entry that recreates this device when replayed.
    pub fn config_entry(&self) -> ConfigEntry {
        ConfigEntry::create(CreateDiskParams {
            name: self.name().to_string(),
            initiator_iqn: Some(self.initiator_iqn().to_string()),
            url: self.url().to_string(),
        })
    }

    pub fn write_config_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.config_entry())
    }

    /// Grow the device. Shrinking or keeping the size is rejected and leaves it unchanged.
    pub fn resize(&self, new_block_count: u64) -> IscsiBdevResult<()> {
        let _resizing = self
            .resize_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.block_count();
        if new_block_count <= current {
            error!(
                bdev = %self.name(),
                current,
                requested = new_block_count,
                "new bdev size must be larger than current bdev size"
            );
            return Err(IscsiBdevError::with_message(
                IscsiBdevErrorKind::InvalidArgument,
                format!("cannot resize {} from {current} to {new_block_count} blocks", self.name()),
            ));
        }
        self.framework
            .notify_blockcnt_change(self.name(), new_block_count)
            .inspect_err(|err| {
                error!(bdev = %self.name(), error = %err, "failed to notify block count change");
            })?;
        self.block_count.store(new_block_count, Ordering::Release);
        info!(bdev = %self.name(), from = current, to = new_block_count, "bdev resized");
        Ok(())
    }

    /// Open a channel on the current reactor. The first channel makes this thread the owner
    /// and starts its poller.
    pub fn get_io_channel(self: &Arc<Self>) -> IscsiBdevResult<IscsiChannel> {
        let thread = current().ok_or_else(|| {
            IscsiBdevError::with_message(
                IscsiBdevErrorKind::Reactor,
                "channels must be opened on a reactor",
            )
        })?;
        let mut state = self.lock_state();
        if state.teardown != Teardown::Live {
            return Err(IscsiBdevError::with_message(
                IscsiBdevErrorKind::NotFound,
                format!("{} is being removed", self.name()),
            ));
        }
        if state.ch_count == 0 {
            let lun = Arc::clone(self);
            let poller = register_poller(
                "iscsi_lun",
                self.config.active_poll_interval(),
                move || lun.poll_tick(PollRole::Active),
            )?;
            debug!(bdev = %self.name(), owner = %thread.id(), "session owner assigned");
            state.owner = Some(thread.clone());
            state.active_poller = Some(poller);
        }
        state.ch_count += 1;
        Ok(IscsiChannel {
            lun: Arc::clone(self),
            thread,
            _local: PhantomData,
        })
    }

    fn destroy_channel(self: &Arc<Self>, thread: &ThreadHandle) {
        let mut state = self.lock_state();
        match state.ch_count {
            0 => {
                warn!(bdev = %self.name(), "channel released with no open channels");
                return;
            }
            1 => {}
            _ => {
                state.ch_count -= 1;
                return;
            }
        }
        let owner = state.owner.clone();
        match owner {
            Some(owner) if owner != *thread => {
                // Last channel closed away from the owner: the count stays at one until the
                // owner thread stops its own poller.
                drop(state);
                let lun = Arc::clone(self);
                let lun_fallback = Arc::clone(self);
                if let Err(err) = owner.send_msg(move || lun.release_last_channel()) {
                    warn!(bdev = %self.name(), error = %err, "owner thread gone, releasing locally");
                    lun_fallback.release_last_channel();
                }
            }
            _ => {
                drop(state);
                self.release_last_channel();
            }
        }
    }

    fn release_last_channel(self: &Arc<Self>) {
        let draining = {
            let mut state = self.lock_state();
            if state.ch_count == 0 {
                return;
            }
            state.ch_count -= 1;
            if state.ch_count > 0 {
                return;
            }
            state.owner = None;
            if let Some(poller) = state.active_poller.take() {
                if let Err(err) = poller.release() {
                    warn!(bdev = %self.name(), error = %err, "failed to stop lun poller");
                }
            }
            debug!(bdev = %self.name(), "session owner released");
            state.teardown == Teardown::Draining
        };
        if draining {
            self.free_if_drained();
        }
    }

    /// Drive the session once on behalf of `role`.
    pub(crate) fn poll_tick(self: &Arc<Self>, role: PollRole) -> PollStatus {
        let finished = match role {
            PollRole::Active => self.pump(),
            PollRole::Fallback => {
                // Holding the bookkeeping lock keeps a new owner from appearing mid-pump.
                let state = match self.state.try_lock() {
                    Ok(state) => state,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    Err(TryLockError::WouldBlock) => return PollStatus::Idle,
                };
                if state.poll_role() != PollRole::Fallback {
                    return PollStatus::Idle;
                }
                let finished = self.pump();
                drop(state);
                finished
            }
        };
        match finished {
            Some(finished) => {
                let drained_any = !finished.is_empty();
                for (task, completion) in finished {
                    self.task_done(task, completion);
                }
                if drained_any {
                    self.free_if_drained();
                }
                PollStatus::Busy
            }
            None => PollStatus::Idle,
        }
    }

    /// Poll and service the session, returning the tasks it finished. `None` when nothing
    /// was ready or another thread holds the session.
    fn pump(&self) -> Option<Vec<(Task, TaskCompletion)>> {
        let mut slot = match self.session.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        let session = slot.session.as_deref_mut()?;
        let revents = match session.poll_events() {
            Ok(revents) => revents,
            Err(err) => {
                error!(bdev = %self.name(), error = %err, "poll failed");
                return None;
            }
        };
        if revents.is_empty() {
            return None;
        }
        let mut completions = Vec::new();
        if let Err(err) = session.service(revents, &mut completions) {
            error!(
                bdev = %self.name(),
                error = %err,
                detail = %session.last_error(),
                "iscsi_service failed"
            );
        }
        let mut finished = Vec::with_capacity(completions.len());
        for completion in completions {
            match slot.inflight.remove(&completion.tag) {
                Some(task) => finished.push((task, completion)),
                None => warn!(bdev = %self.name(), tag = %completion.tag, "completion for unknown task"),
            }
        }
        Some(finished)
    }

    /// Called by the framework when the device is unregistered. Completion is reported
    /// through [`BdevFramework::destruct_done`].
    pub fn destruct(self: &Arc<Self>) {
        let fallback_thread = {
            let mut state = self.lock_state();
            if state.teardown != Teardown::Live {
                warn!(bdev = %self.name(), "destruct requested twice");
                return;
            }
            state.teardown = Teardown::Stopping;
            state.fallback_thread.clone()
        };
        let lun = Arc::clone(self);
        let lun_local = Arc::clone(self);
        if let Err(err) = fallback_thread.send_msg(move || lun.begin_drain()) {
            warn!(bdev = %self.name(), error = %err, "fallback thread gone, tearing down locally");
            lun_local.begin_drain();
        }
    }

    fn begin_drain(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.teardown != Teardown::Stopping {
                return;
            }
            state.teardown = Teardown::Draining;
            let tasks = self.lock_session().inflight.len();
            if state.ch_count > 0 || tasks > 0 {
                debug!(
                    bdev = %self.name(),
                    channels = state.ch_count,
                    tasks,
                    "waiting for channels and in-flight tasks before freeing"
                );
            }
        }
        self.free_if_drained();
    }

    /// Free the device once every channel is closed and the session has nothing in flight.
    fn free_if_drained(self: &Arc<Self>) {
        let fallback = {
            let mut state = self.lock_state();
            if state.teardown != Teardown::Draining || state.ch_count > 0 {
                return;
            }
            if !self.lock_session().inflight.is_empty() {
                return;
            }
            state.teardown = Teardown::Freed;
            state.fallback_poller.take()
        };
        if let Some(poller) = fallback {
            if let Err(err) = poller.release() {
                warn!(bdev = %self.name(), error = %err, "failed to stop fallback poller");
            }
        }
        self.free();
    }

    fn free(&self) {
        let session = self.lock_session().session.take();
        drop(session);
        info!(bdev = %self.name(), "iscsi lun freed");
        self.framework.destruct_done(self.name(), Ok(()));
    }

    fn lock_state(&self) -> MutexGuard<'_, LunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn lock_session(&self) -> MutexGuard<'_, SessionSlot> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for IscsiLun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IscsiLun")
            .field("name", &self.identity.name)
            .field("url", &self.identity.url)
            .field("lun_id", &self.lun_id)
            .field("block_len", &self.block_len)
            .field("block_count", &self.block_count())
            .field("unmap_supported", &self.unmap_supported)
            .field("max_unmap", &self.max_unmap)
            .finish()
    }
}

/// A consumer's handle for submitting I/O from one reactor thread.
///
/// Channels are bound to the thread that opened them. Dropping the last channel releases
/// session ownership.
pub struct IscsiChannel {
    lun: Arc<IscsiLun>,
    thread: ThreadHandle,
    _local: PhantomData<*const ()>,
}

impl IscsiChannel {
    pub fn lun(&self) -> &Arc<IscsiLun> {
        &self.lun
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn submit(&self, io: BdevIo) {
        self.lun.submit_request(&self.thread, io);
    }
}

impl Drop for IscsiChannel {
    fn drop(&mut self) {
        self.lun.destroy_channel(&self.thread);
    }
}

impl fmt::Debug for IscsiChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IscsiChannel")
            .field("lun", &self.lun.name())
            .field("thread", &self.thread)
            .finish()
    }
}
