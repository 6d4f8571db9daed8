use crate::{IscsiBdevError, IscsiBdevErrorKind, IscsiBdevResult};
use url::Url;

pub const DEFAULT_ISCSI_PORT: u16 = 3260;

/// Parsed `iscsi://[user[%password]@]host[:port]/<target-iqn>/<lun>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IscsiUrl {
    /// `host:port`, ready for the session layer.
    pub portal: String,
    pub target: String,
    pub lun: u32,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl IscsiUrl {
    pub fn parse(raw: &str) -> IscsiBdevResult<Self> {
        let url = Url::parse(raw).map_err(|err| invalid(raw, &err.to_string()))?;
        if url.scheme() != "iscsi" {
            return Err(invalid(raw, "scheme must be iscsi"));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid(raw, "missing portal host"))?;
        let portal = format!("{}:{}", host, url.port().unwrap_or(DEFAULT_ISCSI_PORT));

        let mut segments = url
            .path_segments()
            .ok_or_else(|| invalid(raw, "missing target"))?
            .filter(|segment| !segment.is_empty());
        let target = segments
            .next()
            .ok_or_else(|| invalid(raw, "missing target"))?
            .to_string();
        let lun = segments
            .next()
            .ok_or_else(|| invalid(raw, "missing lun"))?
            .parse::<u32>()
            .map_err(|_| invalid(raw, "lun is not a number"))?;
        if segments.next().is_some() {
            return Err(invalid(raw, "trailing path segments"));
        }

        let (user, password) = credentials(&url);
        Ok(Self {
            portal,
            target,
            lun,
            user,
            password,
        })
    }
}

// Initiator URLs separate user and password with '%', `user:password` is accepted too.
fn credentials(url: &Url) -> (Option<String>, Option<String>) {
    let username = url.username();
    if username.is_empty() {
        return (None, None);
    }
    if let Some(password) = url.password() {
        return (Some(username.to_string()), Some(password.to_string()));
    }
    match username.split_once('%') {
        Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
        None => (Some(username.to_string()), None),
    }
}

fn invalid(raw: &str, reason: &str) -> IscsiBdevError {
    IscsiBdevError::with_message(
        IscsiBdevErrorKind::InvalidArgument,
        format!("invalid iscsi url {raw}: {reason}"),
    )
}
