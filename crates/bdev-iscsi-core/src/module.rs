use std::sync::Arc;
use tracing::{error, info};

use crate::bdev::BdevFramework;
use crate::config::{CREATE_METHOD, ConfigEntry};
use crate::conn::{ConnRequest, ConnectionQueue};
use crate::discovery::Discovery;
use crate::iscsi_url::IscsiUrl;
use crate::lun::LunIdentity;
use crate::session::{HeaderDigest, IscsiSession, SessionFactory, SessionType};
use crate::{IscsiBdevConfig, IscsiBdevError, IscsiBdevErrorKind, IscsiBdevResult, IscsiLun};

/// The iSCSI block device module: creates and deletes devices backed by remote LUNs.
pub struct IscsiBdevModule {
    config: Arc<IscsiBdevConfig>,
    framework: Arc<dyn BdevFramework>,
    sessions: Arc<dyn SessionFactory>,
    queue: Arc<ConnectionQueue>,
}

impl IscsiBdevModule {
    pub fn new(
        config: IscsiBdevConfig,
        framework: Arc<dyn BdevFramework>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let config = Arc::new(config);
        let queue = Arc::new(ConnectionQueue::new(
            Arc::clone(&config),
            Arc::clone(&framework),
        ));
        Self {
            config,
            framework,
            sessions,
            queue,
        }
    }

    pub fn config(&self) -> &IscsiBdevConfig {
        &self.config
    }

    /// Start creating device `name` for the LUN at `url`.
    ///
    /// Must be called on a reactor. Connections are driven by the module's connection poller,
    /// which lives on whichever reactor submitted while the queue was idle; a call made while
    /// other creations are pending joins that poller wherever it runs. The created device's
    /// fallback poller, used while no channel is open, runs on that same reactor. `cb` runs
    /// there too. An `Err` return means nothing was started and `cb` will not run. Otherwise
    /// `cb` runs exactly once with the device or the failure.
    pub fn create_disk<F>(
        &self,
        name: &str,
        url: &str,
        initiator_iqn: &str,
        cb: F,
    ) -> IscsiBdevResult<()>
    where
        F: FnOnce(IscsiBdevResult<Arc<IscsiLun>>) + Send + 'static,
    {
        if name.is_empty() || url.is_empty() || initiator_iqn.is_empty() {
            return Err(IscsiBdevError::with_message(
                IscsiBdevErrorKind::InvalidArgument,
                "name, url and initiator iqn are required",
            ));
        }
        let parsed = IscsiUrl::parse(url).inspect_err(|err| {
            error!(url, error = %err, "could not parse URL");
        })?;
        let mut session = self.sessions.create_context(initiator_iqn)?;
        let mut discovery = Discovery::new(parsed.lun, &self.config);
        if let Err(err) = start_session(session.as_mut(), &mut discovery, &parsed) {
            error!(
                url,
                error = %err,
                detail = %session.last_error(),
                "failed to connect provided URL"
            );
            return Err(err);
        }
        let identity = LunIdentity {
            name: name.to_string(),
            url: url.to_string(),
            initiator_iqn: initiator_iqn.to_string(),
        };
        info!(bdev = name, url, lun = parsed.lun, "connecting iscsi lun");
        self.queue.submit(ConnRequest::new(
            identity,
            session,
            discovery,
            Box::new(cb),
        ))
    }

    /// Recreate a device from an entry produced by [`IscsiLun::write_config_json`].
    pub fn replay_config<F>(&self, entry: &serde_json::Value, cb: F) -> IscsiBdevResult<()>
    where
        F: FnOnce(IscsiBdevResult<Arc<IscsiLun>>) + Send + 'static,
    {
        let entry: ConfigEntry = serde_json::from_value(entry.clone()).map_err(|err| {
            IscsiBdevError::with_message(IscsiBdevErrorKind::InvalidArgument, err.to_string())
        })?;
        if entry.method != CREATE_METHOD {
            return Err(IscsiBdevError::with_message(
                IscsiBdevErrorKind::InvalidArgument,
                format!("unknown method {}", entry.method),
            ));
        }
        let params = entry.params;
        let initiator_iqn = params
            .initiator_iqn
            .unwrap_or_else(|| self.config.default_initiator_name.clone());
        self.create_disk(&params.name, &params.url, &initiator_iqn, cb)
    }

    /// Remove device `name`. `cb` always runs, with the framework's error when the name
    /// is unknown.
    pub fn delete_disk<F>(&self, name: &str, cb: F)
    where
        F: FnOnce(IscsiBdevResult<()>) + Send + 'static,
    {
        if let Err((err, cb)) = self.framework.unregister(name, Box::new(cb)) {
            error!(bdev = name, error = %err, "failed to delete iscsi bdev");
            cb(Err(err));
        }
    }

    /// Number of device creations still negotiating.
    pub fn pending_connections(&self) -> usize {
        self.queue.len()
    }

    pub fn connection_poller_active(&self) -> bool {
        self.queue.poller_active()
    }

    /// Module shutdown: abandon pending creations without running their callbacks.
    pub fn fini(&self) {
        self.queue.fini();
    }
}

fn start_session(
    session: &mut dyn IscsiSession,
    discovery: &mut Discovery,
    url: &IscsiUrl,
) -> IscsiBdevResult<()> {
    session.set_session_type(SessionType::Normal)?;
    session.set_header_digest(HeaderDigest::None)?;
    session.set_targetname(&url.target)?;
    if let Some(user) = url.user.as_deref() {
        session.set_initiator_username_pwd(user, url.password.as_deref().unwrap_or(""))?;
    }
    discovery.start(session, &url.portal)
}
