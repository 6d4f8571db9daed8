//! Negotiation run once per new device: login, provisioning inquiry, block limits inquiry,
//! capacity query.

use bdev_iscsi_proto::{
    INQUIRY_ALLOC_LEN, INQUIRY_PAGE_BLOCK_LIMITS, INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING,
    InquiryBlockLimits, InquiryLogicalBlockProvisioning, ReadCapacity16,
};
use tracing::{debug, error, warn};

use crate::session::{IscsiSession, TaskCompletion, TaskPayload, TaskTag};
use crate::{IscsiBdevConfig, IscsiBdevError, IscsiBdevErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    Connecting,
    QueryProvisioning,
    QueryBlockLimits,
    QueryCapacity,
    Registered,
    Failed,
}

impl DiscoveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DiscoveryState::Registered | DiscoveryState::Failed)
    }
}

/// Geometry and capabilities learned during discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LunGeometry {
    pub lun: u32,
    pub num_blocks: u64,
    pub block_len: u32,
    pub phys_block_len: u32,
    pub unmap_supported: bool,
    /// Blocks per UNMAP descriptor; non-zero whenever `unmap_supported`.
    pub max_unmap: u32,
}

/// Result of feeding one completion into [`Discovery`].
#[derive(Debug)]
pub enum Progress {
    Pending,
    Complete(LunGeometry),
    Failed(IscsiBdevError),
}

/// Discovery state machine for one pending device.
#[derive(Debug)]
pub struct Discovery {
    state: DiscoveryState,
    lun: u32,
    unmap_supported: bool,
    max_unmap: u32,
    default_max_unmap: u32,
    capacity_retries_left: u32,
    outstanding: Option<TaskTag>,
    next_tag: u64,
}

impl Discovery {
    pub fn new(lun: u32, config: &IscsiBdevConfig) -> Self {
        Self {
            state: DiscoveryState::Connecting,
            lun,
            unmap_supported: false,
            max_unmap: 0,
            default_max_unmap: config.default_max_unmap_lba_count,
            capacity_retries_left: config.max_capacity_change_retries,
            outstanding: None,
            next_tag: 1,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Begin login. Errors here are synchronous creation failures.
    pub fn start(
        &mut self,
        session: &mut dyn IscsiSession,
        portal: &str,
    ) -> Result<(), IscsiBdevError> {
        let tag = self.take_tag();
        session.full_connect_async(portal, self.lun, tag)?;
        self.outstanding = Some(tag);
        Ok(())
    }

    /// Advance on a finished task. Completions for tasks this machine did not issue are
    /// ignored.
    pub fn on_completion(
        &mut self,
        session: &mut dyn IscsiSession,
        completion: TaskCompletion,
    ) -> Progress {
        if self.state.is_terminal() || self.outstanding != Some(completion.tag) {
            warn!(
                tag = %completion.tag,
                state = ?self.state,
                "ignoring unexpected discovery completion"
            );
            return Progress::Pending;
        }
        self.outstanding = None;
        let progress = match self.state {
            DiscoveryState::Connecting => self.connected(session, completion),
            DiscoveryState::QueryProvisioning => self.provisioning(session, completion),
            DiscoveryState::QueryBlockLimits => self.block_limits(session, completion),
            DiscoveryState::QueryCapacity => self.capacity(session, completion),
            DiscoveryState::Registered | DiscoveryState::Failed => Progress::Pending,
        };
        match &progress {
            Progress::Pending => {}
            Progress::Complete(_) => self.state = DiscoveryState::Registered,
            Progress::Failed(_) => self.state = DiscoveryState::Failed,
        }
        progress
    }

    fn connected(&mut self, session: &mut dyn IscsiSession, c: TaskCompletion) -> Progress {
        if !c.is_good() {
            error!(status = %c.status, error = %session.last_error(), "iscsi login failed");
            return Progress::Failed(IscsiBdevError::scsi(c.status, session.last_error()));
        }
        self.issue_inquiry(
            session,
            INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING,
            DiscoveryState::QueryProvisioning,
        )
    }

    fn provisioning(&mut self, session: &mut dyn IscsiSession, c: TaskCompletion) -> Progress {
        let lbp = match (&c.payload, c.is_good()) {
            (TaskPayload::DataIn(data), true) => InquiryLogicalBlockProvisioning::decode(data).ok(),
            _ => None,
        };
        if lbp.is_some_and(|lbp| lbp.lbpu) {
            self.unmap_supported = true;
            self.max_unmap = self.default_max_unmap;
            return self.issue_inquiry(
                session,
                INQUIRY_PAGE_BLOCK_LIMITS,
                DiscoveryState::QueryBlockLimits,
            );
        }
        self.issue_readcapacity(session)
    }

    fn block_limits(&mut self, session: &mut dyn IscsiSession, c: TaskCompletion) -> Progress {
        if let (TaskPayload::DataIn(data), true) = (&c.payload, c.is_good()) {
            if let Ok(limits) = InquiryBlockLimits::decode(data) {
                if limits.max_unmap == 0 {
                    warn!(
                        default = self.default_max_unmap,
                        "target reported invalid max_unmap, using default"
                    );
                    self.max_unmap = self.default_max_unmap;
                } else {
                    self.max_unmap = limits.max_unmap;
                }
            }
        }
        self.issue_readcapacity(session)
    }

    fn capacity(&mut self, session: &mut dyn IscsiSession, c: TaskCompletion) -> Progress {
        if !c.is_good() {
            if c.is_capacity_changed() && self.capacity_retries_left > 0 {
                self.capacity_retries_left -= 1;
                warn!(lun = self.lun, "capacity data changed during discovery, querying again");
                return self.issue_readcapacity(session);
            }
            error!(status = %c.status, error = %session.last_error(), "readcapacity16 failed");
            return Progress::Failed(IscsiBdevError::scsi(c.status, "readcapacity16 failed"));
        }
        let TaskPayload::DataIn(data) = &c.payload else {
            return Progress::Failed(IscsiBdevError::with_message(
                IscsiBdevErrorKind::Protocol,
                "readcapacity16 returned no data",
            ));
        };
        let capacity = match ReadCapacity16::decode(data) {
            Ok(capacity) => capacity,
            Err(err) => return Progress::Failed(err.into()),
        };
        let (Some(num_blocks), Some(phys_block_len)) =
            (capacity.num_blocks(), capacity.physical_block_length())
        else {
            return Progress::Failed(IscsiBdevError::with_message(
                IscsiBdevErrorKind::Protocol,
                "readcapacity16 geometry overflows",
            ));
        };
        let geometry = LunGeometry {
            lun: self.lun,
            num_blocks,
            block_len: capacity.block_length,
            phys_block_len,
            unmap_supported: self.unmap_supported,
            max_unmap: if self.unmap_supported { self.max_unmap } else { 0 },
        };
        debug!(?geometry, "discovery complete");
        Progress::Complete(geometry)
    }

    fn issue_inquiry(
        &mut self,
        session: &mut dyn IscsiSession,
        page: u8,
        next: DiscoveryState,
    ) -> Progress {
        let tag = self.take_tag();
        match session.inquiry(self.lun, true, page, INQUIRY_ALLOC_LEN, tag) {
            Ok(()) => self.advance(next, tag),
            Err(err) => {
                error!(page, error = %err, "failed to issue inquiry");
                Progress::Failed(err.into())
            }
        }
    }

    fn issue_readcapacity(&mut self, session: &mut dyn IscsiSession) -> Progress {
        let tag = self.take_tag();
        match session.readcapacity16(self.lun, tag) {
            Ok(()) => self.advance(DiscoveryState::QueryCapacity, tag),
            Err(err) => {
                error!(error = %err, "failed to issue readcapacity16");
                Progress::Failed(err.into())
            }
        }
    }

    fn advance(&mut self, next: DiscoveryState, tag: TaskTag) -> Progress {
        debug!(from = ?self.state, to = ?next, lun = self.lun, "discovery step");
        self.state = next;
        self.outstanding = Some(tag);
        Progress::Pending
    }

    fn take_tag(&mut self) -> TaskTag {
        let tag = TaskTag(self.next_tag);
        self.next_tag += 1;
        tag
    }
}
