#![allow(dead_code)]

use bdev_iscsi_core::{
    BdevFramework, BdevIo, DataTransfer, HeaderDigest, IoStatus, IoType, IscsiBdevConfig,
    IscsiBdevError, IscsiBdevErrorKind, IscsiBdevModule, IscsiBdevResult, IscsiChannel, IscsiLun,
    IscsiSession, PollEvents, RejectedTransfer, SessionError, SessionErrorKind, SessionFactory,
    SessionResult, SessionType, TaskCompletion, TaskPayload, TaskTag, UnregisterCallback,
};
use bdev_iscsi_proto::{
    ASCQ_CAPACITY_DATA_HAS_CHANGED, INQUIRY_PAGE_BLOCK_LIMITS,
    INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING, InquiryBlockLimits,
    InquiryLogicalBlockProvisioning, ReadCapacity16, ScsiStatus, Sense, SenseKey,
    UnmapDescriptor,
};
use bdev_iscsi_reactor::{Reactor, ThreadId, current};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const TARGET_URL: &str = "iscsi://127.0.0.1/iqn.2016-06.io.spdk:disk1/0";
pub const INITIATOR: &str = "iqn.2016-06.io.spdk:init";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with every poller running on each manual tick.
pub fn test_config() -> IscsiBdevConfig {
    IscsiBdevConfig {
        connection_poll_interval_us: 0,
        active_poll_interval_us: 0,
        idle_poll_interval_us: 0,
        ..IscsiBdevConfig::default()
    }
}

/// Commands received by [`MockTarget`], in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Connect { portal: String, lun: u32 },
    Inquiry { page: u8 },
    ReadCapacity,
    Read { lba: u64, len: u32 },
    Write { lba: u64, len: u32 },
    SyncCache { lba: u64, num_blocks: u32 },
    Unmap { descriptors: Vec<UnmapDescriptor> },
    Reset,
}

impl Command {
    pub fn is_discovery(&self) -> bool {
        matches!(self, Command::Connect { .. } | Command::Inquiry { .. })
    }
}

pub struct TargetState {
    pub num_blocks: u64,
    pub block_len: u32,
    pub lbppbe: u8,
    pub lbpu: bool,
    pub max_unmap: u32,
    pub connect_status: ScsiStatus,
    pub tmf_response: u32,
    /// Upcoming reads and writes answered with CAPACITY DATA HAS CHANGED.
    pub capacity_changes: u32,
    /// Capacity the LUN takes when a capacity change is reported.
    pub grow_to: Option<u64>,
    /// Sense returned by the next read or write.
    pub io_sense: Option<Sense>,
    pub refuse_tasks: bool,
    pub blocks: HashMap<u64, Vec<u8>>,
    pub commands: Vec<Command>,
    pub service_threads: Vec<Option<ThreadId>>,
    pub initiators: Vec<String>,
    pub targetname: Option<String>,
    pub credentials: Option<(String, String)>,
    pub sessions_created: usize,
    pub sessions_dropped: usize,
}

/// In-memory iSCSI target answering every task immediately.
#[derive(Clone)]
pub struct MockTarget(Arc<Mutex<TargetState>>);

impl MockTarget {
    pub fn new(num_blocks: u64, block_len: u32) -> Self {
        Self(Arc::new(Mutex::new(TargetState {
            num_blocks,
            block_len,
            lbppbe: 0,
            lbpu: false,
            max_unmap: 0,
            connect_status: ScsiStatus::GOOD,
            tmf_response: 0,
            capacity_changes: 0,
            grow_to: None,
            io_sense: None,
            refuse_tasks: false,
            blocks: HashMap::new(),
            commands: Vec::new(),
            service_threads: Vec::new(),
            initiators: Vec::new(),
            targetname: None,
            credentials: None,
            sessions_created: 0,
            sessions_dropped: 0,
        })))
    }

    pub fn with_unmap(self, max_unmap: u32) -> Self {
        {
            let mut state = self.state();
            state.lbpu = true;
            state.max_unmap = max_unmap;
        }
        self
    }

    pub fn state(&self) -> MutexGuard<'_, TargetState> {
        self.0.lock().unwrap()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    /// Commands received after discovery finished.
    pub fn io_commands(&self) -> Vec<Command> {
        let commands = self.commands();
        let start = commands
            .iter()
            .position(|cmd| *cmd == Command::ReadCapacity)
            .map_or(0, |idx| idx + 1);
        commands[start..].to_vec()
    }

    pub fn live_sessions(&self) -> usize {
        let state = self.state();
        state.sessions_created - state.sessions_dropped
    }

    pub fn session(&self) -> MockSession {
        self.state().sessions_created += 1;
        MockSession {
            target: self.clone(),
            ready: Vec::new(),
        }
    }
}

pub struct MockSession {
    target: MockTarget,
    ready: Vec<TaskCompletion>,
}

impl MockSession {
    fn accept(&self, command: Command) -> SessionResult<MutexGuard<'_, TargetState>> {
        let mut state = self.target.0.lock().unwrap();
        if state.refuse_tasks {
            return Err(SessionError::with_message(SessionErrorKind::OutOfMemory, "no task"));
        }
        state.commands.push(command);
        Ok(state)
    }

    /// Failure injected into the next read or write, if any.
    fn io_failure(state: &mut TargetState) -> Option<(ScsiStatus, Sense)> {
        if state.capacity_changes > 0 {
            state.capacity_changes -= 1;
            if let Some(grow_to) = state.grow_to {
                state.num_blocks = grow_to;
            }
            let sense = Sense::from_ascq_word(SenseKey::UnitAttention, ASCQ_CAPACITY_DATA_HAS_CHANGED);
            return Some((ScsiStatus::CHECK_CONDITION, sense));
        }
        state
            .io_sense
            .take()
            .map(|sense| (ScsiStatus::CHECK_CONDITION, sense))
    }

    fn transfer(
        &mut self,
        command: Command,
        transfer: DataTransfer,
        tag: TaskTag,
        write: bool,
    ) -> Result<(), RejectedTransfer> {
        let mut buffers = transfer.buffers;
        let completion = {
            let mut state = match self.accept(command) {
                Ok(state) => state,
                Err(error) => return Err(RejectedTransfer { error, buffers }),
            };
            match Self::io_failure(&mut state) {
                Some((status, sense)) => TaskCompletion {
                    tag,
                    status,
                    sense,
                    payload: TaskPayload::Buffers(buffers),
                },
                None => {
                    let block_len = transfer.block_len as usize;
                    let blocks = transfer.len as usize / block_len;
                    if write {
                        let data: Vec<u8> = buffers.iter().flatten().copied().collect();
                        for (idx, chunk) in data.chunks(block_len).take(blocks).enumerate() {
                            state.blocks.insert(transfer.lba + idx as u64, chunk.to_vec());
                        }
                    } else {
                        let mut data = Vec::with_capacity(transfer.len as usize);
                        for idx in 0..blocks as u64 {
                            match state.blocks.get(&(transfer.lba + idx)) {
                                Some(block) => data.extend_from_slice(block),
                                None => data.resize(data.len() + block_len, 0),
                            }
                        }
                        let mut offset = 0;
                        for buf in buffers.iter_mut() {
                            let n = buf.len().min(data.len() - offset);
                            buf[..n].copy_from_slice(&data[offset..offset + n]);
                            offset += n;
                        }
                    }
                    TaskCompletion::good(tag, TaskPayload::Buffers(buffers))
                }
            }
        };
        self.ready.push(completion);
        Ok(())
    }
}

impl IscsiSession for MockSession {
    fn set_session_type(&mut self, _: SessionType) -> SessionResult<()> {
        Ok(())
    }

    fn set_header_digest(&mut self, _: HeaderDigest) -> SessionResult<()> {
        Ok(())
    }

    fn set_targetname(&mut self, target: &str) -> SessionResult<()> {
        self.target.state().targetname = Some(target.to_string());
        Ok(())
    }

    fn set_initiator_username_pwd(&mut self, user: &str, password: &str) -> SessionResult<()> {
        self.target.state().credentials = Some((user.to_string(), password.to_string()));
        Ok(())
    }

    fn full_connect_async(&mut self, portal: &str, lun: u32, tag: TaskTag) -> SessionResult<()> {
        let status = self
            .accept(Command::Connect {
                portal: portal.to_string(),
                lun,
            })?
            .connect_status;
        self.ready.push(TaskCompletion {
            tag,
            status,
            sense: Sense::NONE,
            payload: TaskPayload::None,
        });
        Ok(())
    }

    fn inquiry(
        &mut self,
        _lun: u32,
        _evpd: bool,
        page: u8,
        _alloc_len: u16,
        tag: TaskTag,
    ) -> SessionResult<()> {
        let completion = {
            let state = self.accept(Command::Inquiry { page })?;
            match page {
                INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING => {
                    let lbp = InquiryLogicalBlockProvisioning {
                        lbpu: state.lbpu,
                        ..Default::default()
                    };
                    TaskCompletion::good(tag, TaskPayload::DataIn(lbp.encode().to_vec()))
                }
                INQUIRY_PAGE_BLOCK_LIMITS => {
                    let limits = InquiryBlockLimits {
                        max_unmap: state.max_unmap,
                        ..Default::default()
                    };
                    TaskCompletion::good(tag, TaskPayload::DataIn(limits.encode().to_vec()))
                }
                _ => TaskCompletion::check_condition(
                    tag,
                    Sense::new(SenseKey::IllegalRequest, 0x24, 0x00),
                ),
            }
        };
        self.ready.push(completion);
        Ok(())
    }

    fn readcapacity16(&mut self, _lun: u32, tag: TaskTag) -> SessionResult<()> {
        let data = {
            let state = self.accept(Command::ReadCapacity)?;
            ReadCapacity16 {
                returned_lba: state.num_blocks - 1,
                block_length: state.block_len,
                lbppbe: state.lbppbe,
                lbpme: state.lbpu,
                ..Default::default()
            }
            .encode()
            .to_vec()
        };
        self.ready
            .push(TaskCompletion::good(tag, TaskPayload::DataIn(data)));
        Ok(())
    }

    fn read16(&mut self, transfer: DataTransfer, tag: TaskTag) -> Result<(), RejectedTransfer> {
        let command = Command::Read {
            lba: transfer.lba,
            len: transfer.len,
        };
        self.transfer(command, transfer, tag, false)
    }

    fn write16(&mut self, transfer: DataTransfer, tag: TaskTag) -> Result<(), RejectedTransfer> {
        let command = Command::Write {
            lba: transfer.lba,
            len: transfer.len,
        };
        self.transfer(command, transfer, tag, true)
    }

    fn synchronizecache16(
        &mut self,
        _lun: u32,
        lba: u64,
        num_blocks: u32,
        tag: TaskTag,
    ) -> SessionResult<()> {
        self.accept(Command::SyncCache { lba, num_blocks })?;
        self.ready
            .push(TaskCompletion::good(tag, TaskPayload::None));
        Ok(())
    }

    fn unmap(
        &mut self,
        _lun: u32,
        descriptors: &[UnmapDescriptor],
        tag: TaskTag,
    ) -> SessionResult<()> {
        {
            let mut state = self.accept(Command::Unmap {
                descriptors: descriptors.to_vec(),
            })?;
            for desc in descriptors {
                for lba in desc.lba..desc.lba + u64::from(desc.num_blocks) {
                    state.blocks.remove(&lba);
                }
            }
        }
        self.ready
            .push(TaskCompletion::good(tag, TaskPayload::None));
        Ok(())
    }

    fn task_mgmt_lun_reset(&mut self, _lun: u32, tag: TaskTag) -> SessionResult<()> {
        let response = self.accept(Command::Reset)?.tmf_response;
        self.ready
            .push(TaskCompletion::good(tag, TaskPayload::TmfResponse(response)));
        Ok(())
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn which_events(&self) -> PollEvents {
        PollEvents::IN | PollEvents::OUT
    }

    fn poll_events(&self) -> SessionResult<PollEvents> {
        Ok(if self.ready.is_empty() {
            PollEvents::empty()
        } else {
            PollEvents::IN
        })
    }

    fn service(
        &mut self,
        _revents: PollEvents,
        completions: &mut Vec<TaskCompletion>,
    ) -> SessionResult<()> {
        self.target
            .state()
            .service_threads
            .push(current().map(|thread| thread.id()));
        completions.append(&mut self.ready);
        Ok(())
    }

    fn last_error(&self) -> String {
        "mock target error".to_string()
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.target.state().sessions_dropped += 1;
    }
}

pub struct MockFactory {
    pub target: MockTarget,
    pub fail: AtomicBool,
}

impl MockFactory {
    pub fn new(target: MockTarget) -> Self {
        Self {
            target,
            fail: AtomicBool::new(false),
        }
    }
}

impl SessionFactory for MockFactory {
    fn create_context(&self, initiator_iqn: &str) -> IscsiBdevResult<Box<dyn IscsiSession>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(IscsiBdevError::new(IscsiBdevErrorKind::OutOfMemory));
        }
        self.target
            .state()
            .initiators
            .push(initiator_iqn.to_string());
        Ok(Box::new(self.target.session()))
    }
}

#[derive(Default)]
struct FrameworkState {
    luns: HashMap<String, Arc<IscsiLun>>,
    unregistering: HashMap<String, UnregisterCallback>,
    blockcnt_changes: Vec<(String, u64)>,
    destructed: Vec<String>,
}

/// Block-device framework double that records every call.
#[derive(Default)]
pub struct RecordingFramework {
    state: Mutex<FrameworkState>,
    pub reject_register: AtomicBool,
    pub no_buffers: AtomicBool,
}

impl RecordingFramework {
    pub fn lun(&self, name: &str) -> Option<Arc<IscsiLun>> {
        self.state.lock().unwrap().luns.get(name).cloned()
    }

    pub fn lun_count(&self) -> usize {
        self.state.lock().unwrap().luns.len()
    }

    pub fn blockcnt_changes(&self) -> Vec<(String, u64)> {
        self.state.lock().unwrap().blockcnt_changes.clone()
    }

    pub fn destructed(&self) -> Vec<String> {
        self.state.lock().unwrap().destructed.clone()
    }
}

impl BdevFramework for RecordingFramework {
    fn register(&self, lun: Arc<IscsiLun>) -> IscsiBdevResult<()> {
        if self.reject_register.load(Ordering::SeqCst) {
            return Err(IscsiBdevError::with_message(
                IscsiBdevErrorKind::Framework,
                "registration rejected",
            ));
        }
        let mut state = self.state.lock().unwrap();
        if state.luns.contains_key(lun.name()) {
            return Err(IscsiBdevError::new(IscsiBdevErrorKind::AlreadyExists));
        }
        state.luns.insert(lun.name().to_string(), lun);
        Ok(())
    }

    fn unregister(
        &self,
        name: &str,
        done: UnregisterCallback,
    ) -> Result<(), (IscsiBdevError, UnregisterCallback)> {
        let lun = {
            let mut state = self.state.lock().unwrap();
            let Some(lun) = state.luns.remove(name) else {
                return Err((IscsiBdevError::new(IscsiBdevErrorKind::NotFound), done));
            };
            state.unregistering.insert(name.to_string(), done);
            lun
        };
        lun.destruct();
        Ok(())
    }

    fn get_buf(&self, len: usize) -> Option<Vec<u8>> {
        if self.no_buffers.load(Ordering::SeqCst) {
            None
        } else {
            Some(vec![0u8; len])
        }
    }

    fn notify_blockcnt_change(&self, name: &str, block_count: u64) -> IscsiBdevResult<()> {
        self.state
            .lock()
            .unwrap()
            .blockcnt_changes
            .push((name.to_string(), block_count));
        Ok(())
    }

    fn destruct_done(&self, name: &str, result: IscsiBdevResult<()>) {
        let done = {
            let mut state = self.state.lock().unwrap();
            state.destructed.push(name.to_string());
            state.unregistering.remove(name)
        };
        if let Some(done) = done {
            done(result);
        }
    }
}

/// Run every reactor until `done` holds, failing the test after a bounded number of ticks.
pub fn run_until(reactors: &[&Reactor], mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        for reactor in reactors {
            reactor.run_once();
        }
    }
    assert!(done(), "condition not reached");
}

pub fn run_ticks(reactors: &[&Reactor], ticks: usize) {
    for _ in 0..ticks {
        for reactor in reactors {
            reactor.run_once();
        }
    }
}

/// Shared slot a callback writes its result into.
pub type Slot<T> = Arc<Mutex<Option<T>>>;

pub fn slot<T>() -> Slot<T> {
    Arc::new(Mutex::new(None))
}

/// Outcome of one block I/O as seen by its completion callback.
#[derive(Debug)]
pub struct IoOutcome {
    pub status: IoStatus,
    pub iovs: Vec<Vec<u8>>,
    pub thread: Option<ThreadId>,
    pub calls: usize,
}

pub fn io_slot() -> Slot<IoOutcome> {
    slot()
}

/// Build an I/O whose completion lands in a fresh slot.
pub fn io(io_type: IoType, offset_blocks: u64, num_blocks: u64, iovs: Vec<Vec<u8>>) -> (BdevIo, Slot<IoOutcome>) {
    let outcome = io_slot();
    let sink = outcome.clone();
    let io = BdevIo::new(io_type, offset_blocks, num_blocks, move |status, iovs| {
        let mut sink = sink.lock().unwrap();
        let calls = sink.as_ref().map_or(0, |prev| prev.calls) + 1;
        *sink = Some(IoOutcome {
            status,
            iovs,
            thread: current().map(|thread| thread.id()),
            calls,
        });
    })
    .with_iovs(iovs);
    (io, outcome)
}

/// Submit on the reactor that owns `channel`.
pub fn submit(reactor: &Reactor, channel: &IscsiChannel, io: BdevIo) {
    reactor.enter(|| channel.submit(io));
}

pub fn is_done<T>(slot: &Slot<T>) -> bool {
    slot.lock().unwrap().is_some()
}

pub fn take<T>(slot: &Slot<T>) -> T {
    slot.lock().unwrap().take().expect("callback has run")
}

/// Module, framework and target wired together with a manually driven main reactor.
pub struct Harness {
    pub target: MockTarget,
    pub factory: Arc<MockFactory>,
    pub framework: Arc<RecordingFramework>,
    pub module: IscsiBdevModule,
    pub main: Reactor,
}

impl Harness {
    pub fn new(target: MockTarget) -> Self {
        Self::with_config(target, test_config())
    }

    pub fn with_config(target: MockTarget, config: IscsiBdevConfig) -> Self {
        init_tracing();
        let factory = Arc::new(MockFactory::new(target.clone()));
        let framework = Arc::new(RecordingFramework::default());
        let module = IscsiBdevModule::new(
            config,
            framework.clone() as Arc<dyn BdevFramework>,
            factory.clone() as Arc<dyn SessionFactory>,
        );
        Self {
            target,
            factory,
            framework,
            module,
            main: Reactor::new("main"),
        }
    }

    /// Start a creation on the main reactor and return the callback slot.
    pub fn start_create(&self, name: &str, url: &str) -> Slot<IscsiBdevResult<Arc<IscsiLun>>> {
        let result = slot();
        let sink = result.clone();
        self.main
            .enter(|| {
                self.module.create_disk(name, url, INITIATOR, move |res| {
                    let mut sink = sink.lock().unwrap();
                    assert!(sink.is_none(), "creation callback ran twice");
                    *sink = Some(res);
                })
            })
            .expect("creation accepted");
        result
    }

    /// Create `name` against the default target URL and wait for it.
    pub fn create(&self, name: &str) -> Arc<IscsiLun> {
        let result = self.start_create(name, TARGET_URL);
        run_until(&[&self.main], || is_done(&result));
        take(&result).expect("device created")
    }

    pub fn delete(&self, name: &str) -> Slot<IscsiBdevResult<()>> {
        let result = slot();
        let sink = result.clone();
        self.main.enter(|| {
            self.module.delete_disk(name, move |res| {
                *sink.lock().unwrap() = Some(res);
            })
        });
        result
    }
}
