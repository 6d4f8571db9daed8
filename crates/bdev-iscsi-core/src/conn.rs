//! Pending device creations and the poller that drives their discovery.

use bdev_iscsi_reactor::{PollStatus, PollerHandle, register_poller};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, trace, warn};

use crate::bdev::BdevFramework;
use crate::discovery::{Discovery, LunGeometry, Progress};
use crate::lun::LunIdentity;
use crate::session::IscsiSession;
use crate::{IscsiBdevConfig, IscsiBdevError, IscsiBdevErrorKind, IscsiBdevResult, IscsiLun};

/// Completion of an asynchronous device creation.
pub(crate) type CreateCallback = Box<dyn FnOnce(IscsiBdevResult<Arc<IscsiLun>>) + Send + 'static>;

/// Lifecycle of a connection request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnStatus {
    InProgress,
    Succeeded,
    /// Failed with the status reported to the creation callback.
    Failed(i32),
}

pub(crate) struct ConnRequest {
    identity: LunIdentity,
    session: Option<Box<dyn IscsiSession>>,
    discovery: Discovery,
    callback: Option<CreateCallback>,
    status: ConnStatus,
}

impl ConnRequest {
    pub(crate) fn new(
        identity: LunIdentity,
        session: Box<dyn IscsiSession>,
        discovery: Discovery,
        callback: CreateCallback,
    ) -> Self {
        Self {
            identity,
            session: Some(session),
            discovery,
            callback: Some(callback),
            status: ConnStatus::InProgress,
        }
    }
}

impl fmt::Debug for ConnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnRequest")
            .field("identity", &self.identity)
            .field("state", &self.discovery.state())
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Default)]
struct QueueInner {
    pending: Vec<ConnRequest>,
    poller: Option<PollerHandle>,
    shut_down: bool,
}

/// Process-wide set of in-flight device creations.
pub(crate) struct ConnectionQueue {
    config: Arc<IscsiBdevConfig>,
    framework: Arc<dyn BdevFramework>,
    inner: Mutex<QueueInner>,
}

impl ConnectionQueue {
    pub(crate) fn new(config: Arc<IscsiBdevConfig>, framework: Arc<dyn BdevFramework>) -> Self {
        Self {
            config,
            framework,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Queue `req`, starting the poller on the current reactor if none is running.
    pub(crate) fn submit(self: &Arc<Self>, req: ConnRequest) -> IscsiBdevResult<()> {
        let mut inner = self.lock();
        if inner.shut_down {
            return Err(IscsiBdevError::with_message(
                IscsiBdevErrorKind::Unsupported,
                "iscsi bdev module is shut down",
            ));
        }
        if inner.poller.is_none() {
            let queue = Arc::clone(self);
            let poller = register_poller(
                "iscsi_conn",
                self.config.connection_poll_interval(),
                move || queue.poll(),
            )?;
            inner.poller = Some(poller);
        }
        trace!(bdev = %req.identity.name, url = %req.identity.url, "connection request queued");
        inner.pending.push(req);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn poller_active(&self) -> bool {
        self.lock().poller.is_some()
    }

    /// Drop every pending request without invoking its callback and stop the poller.
    pub(crate) fn fini(&self) {
        let (drained, poller) = {
            let mut inner = self.lock();
            inner.shut_down = true;
            (std::mem::take(&mut inner.pending), inner.poller.take())
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "dropping pending connection requests");
        }
        drop(drained);
        if let Some(poller) = poller {
            if let Err(err) = poller.release() {
                warn!(error = %err, "failed to stop connection poller");
            }
        }
    }

    fn poll(self: &Arc<Self>) -> PollStatus {
        let pending = {
            let mut inner = self.lock();
            if inner.pending.is_empty() {
                if let Some(poller) = inner.poller.take() {
                    if let Err(err) = poller.unregister() {
                        warn!(error = %err, "failed to stop connection poller");
                    }
                }
                return PollStatus::Idle;
            }
            std::mem::take(&mut inner.pending)
        };

        let mut pending = pending;
        for req in pending.iter_mut() {
            self.advance(req);
        }

        // Terminal requests are only dropped here, once no pump of their session is on
        // the stack.
        let (finished, still_pending): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|req| req.status != ConnStatus::InProgress);
        let orphaned = {
            let mut inner = self.lock();
            if inner.shut_down {
                still_pending
            } else {
                let newer = std::mem::replace(&mut inner.pending, still_pending);
                inner.pending.extend(newer);
                Vec::new()
            }
        };
        for req in &finished {
            trace!(bdev = %req.identity.name, status = ?req.status, "connection request reaped");
        }
        drop(finished);
        drop(orphaned);
        PollStatus::Busy
    }

    /// Pump one request's session once and feed its finished tasks to discovery.
    fn advance(&self, req: &mut ConnRequest) {
        let Some(session) = req.session.as_deref_mut() else {
            return;
        };
        let revents = match session.poll_events() {
            Ok(revents) => revents,
            Err(err) => {
                error!(bdev = %req.identity.name, error = %err, "poll failed");
                return;
            }
        };
        if revents.is_empty() {
            return;
        }
        let mut completions = Vec::new();
        if let Err(err) = session.service(revents, &mut completions) {
            error!(
                bdev = %req.identity.name,
                error = %err,
                detail = %session.last_error(),
                "iscsi_service failed"
            );
        }
        for completion in completions {
            if req.status != ConnStatus::InProgress {
                break;
            }
            let Some(session) = req.session.as_deref_mut() else {
                break;
            };
            match req.discovery.on_completion(session, completion) {
                Progress::Pending => {}
                Progress::Complete(geometry) => self.finish(req, Ok(geometry)),
                Progress::Failed(err) => self.finish(req, Err(err)),
            }
        }
    }

    fn finish(&self, req: &mut ConnRequest, result: IscsiBdevResult<LunGeometry>) {
        let outcome = result.and_then(|geometry| {
            let session = req.session.take().ok_or_else(|| {
                IscsiBdevError::with_message(IscsiBdevErrorKind::Session, "session already closed")
            })?;
            IscsiLun::create(
                req.identity.clone(),
                geometry,
                session,
                Arc::clone(&self.config),
                Arc::clone(&self.framework),
            )
        });
        req.status = match &outcome {
            Ok(_) => ConnStatus::Succeeded,
            Err(err) => {
                error!(
                    bdev = %req.identity.name,
                    url = %req.identity.url,
                    status = err.status(),
                    error = %err,
                    "iscsi bdev creation failed"
                );
                ConnStatus::Failed(err.status())
            }
        };
        if let Some(callback) = req.callback.take() {
            callback(outcome);
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
