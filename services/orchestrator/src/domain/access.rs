//! Access methods: the credentialed ways to reach a running instance.
//!
//! Secrets issued by the provider are held in [`Secret`], which has no
//! `Serialize` impl and a redacted `Debug`. Read paths go through
//! [`AccessMethodView`], which only reports whether a secret exists. The only
//! accessor that exposes secret material is [`AccessMethod::handoff`], used by
//! the provisioning hand-off.

use chrono::{DateTime, Utc};
use labfleet_id::AccessMethodId;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Supported ways of reaching an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Ssh,
    WebUrl,
    Guacamole,
    Rdp,
    Vnc,
}

impl AccessKind {
    pub const ALL: [AccessKind; 5] = [
        AccessKind::Ssh,
        AccessKind::WebUrl,
        AccessKind::Guacamole,
        AccessKind::Rdp,
        AccessKind::Vnc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::WebUrl => "web_url",
            Self::Guacamole => "guacamole",
            Self::Rdp => "rdp",
            Self::Vnc => "vnc",
        }
    }
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownAccessType(s.to_string()))
    }
}

/// Secret material (password or private key).
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Exposes the raw value. Only the provisioning hand-off and the store
    /// adapters may call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Access details as issued by the provider, before they are attached to an
/// instance.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedAccess {
    pub kind: AccessKind,
    pub url: Option<String>,
    pub username: Option<String>,
    pub secret: Option<Secret>,
    pub port: Option<u16>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IssuedAccess {
    pub fn ssh(username: impl Into<String>, secret: Secret, port: u16) -> Self {
        Self {
            kind: AccessKind::Ssh,
            url: None,
            username: Some(username.into()),
            secret: Some(secret),
            port: Some(port),
            expires_at: None,
        }
    }

    pub fn url(kind: AccessKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: Some(url.into()),
            username: None,
            secret: None,
            port: None,
            expires_at: None,
        }
    }

    pub fn port(kind: AccessKind, port: u16) -> Self {
        Self {
            kind,
            url: None,
            username: None,
            secret: None,
            port: Some(port),
            expires_at: None,
        }
    }

    /// Checks that the connection fields required by `kind` are present.
    pub fn validate(&self) -> Result<(), String> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        match self.kind {
            AccessKind::Ssh => {
                if !present(&self.username) {
                    return Err("ssh access requires a username".into());
                }
                if self.secret.as_ref().is_none_or(Secret::is_empty) {
                    return Err("ssh access requires a credential".into());
                }
            }
            AccessKind::WebUrl | AccessKind::Guacamole => {
                if !present(&self.url) {
                    return Err(format!("{} access requires a url", self.kind));
                }
            }
            AccessKind::Rdp | AccessKind::Vnc => {
                if self.port.is_none() {
                    return Err(format!("{} access requires a port", self.kind));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn attach(self, now: DateTime<Utc>) -> AccessMethod {
        AccessMethod {
            id: AccessMethodId::new(),
            kind: self.kind,
            url: self.url,
            username: self.username,
            secret: self.secret,
            port: self.port,
            active: true,
            expires_at: self.expires_at,
            created_at: now,
        }
    }
}

/// An access method attached to an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessMethod {
    pub id: AccessMethodId,
    pub kind: AccessKind,
    pub url: Option<String>,
    pub username: Option<String>,
    pub secret: Option<Secret>,
    pub port: Option<u16>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AccessMethod {
    /// Active and not yet expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|at| at > now)
    }

    /// Secret-free view for read paths.
    pub fn view(&self, now: DateTime<Utc>) -> AccessMethodView {
        AccessMethodView {
            id: self.id,
            kind: self.kind,
            url: self.url.clone(),
            username: self.username.clone(),
            port: self.port,
            usable: self.is_usable(now),
            expires_at: self.expires_at,
            has_secret: self.secret.is_some(),
        }
    }

    /// Full credential for the provisioning hand-off. Returns `None` for
    /// methods that are no longer usable.
    pub fn handoff(&self, now: DateTime<Utc>) -> Option<HandoffCredential> {
        if !self.is_usable(now) {
            return None;
        }
        Some(HandoffCredential {
            kind: self.kind,
            url: self.url.clone(),
            username: self.username.clone(),
            secret: self.secret.clone(),
            port: self.port,
        })
    }
}

/// What read paths see of an access method.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct AccessMethodView {
    pub id: AccessMethodId,
    pub kind: AccessKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub usable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub has_secret: bool,
}

/// Credential handed to the provisioning side.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffCredential {
    pub kind: AccessKind,
    pub url: Option<String>,
    pub username: Option<String>,
    pub secret: Option<Secret>,
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn parses_known_access_types() {
        assert_eq!("ssh".parse::<AccessKind>().unwrap(), AccessKind::Ssh);
        assert_eq!("WEB_URL".parse::<AccessKind>().unwrap(), AccessKind::WebUrl);
        assert!(matches!(
            "telnet".parse::<AccessKind>(),
            Err(ValidationError::UnknownAccessType(_))
        ));
    }

    #[test]
    fn ssh_requires_username_and_credential() {
        let ok = IssuedAccess::ssh("student", Secret::new("pw"), 22);
        assert!(ok.validate().is_ok());

        let mut missing_secret = ok.clone();
        missing_secret.secret = None;
        assert!(missing_secret.validate().is_err());

        let mut missing_user = ok;
        missing_user.username = Some("  ".into());
        assert!(missing_user.validate().is_err());
    }

    #[test]
    fn url_kinds_require_url() {
        assert!(IssuedAccess::url(AccessKind::WebUrl, "https://lab/1")
            .validate()
            .is_ok());
        let mut bad = IssuedAccess::url(AccessKind::Guacamole, "x");
        bad.url = None;
        assert!(bad.validate().is_err());
        assert!(IssuedAccess::port(AccessKind::Rdp, 3389).validate().is_ok());
    }

    #[test]
    fn secret_is_redacted_in_debug_and_views() {
        let now = Utc::now();
        let method = IssuedAccess::ssh("student", Secret::new("hunter2"), 22).attach(now);

        assert!(!format!("{method:?}").contains("hunter2"));

        let json = serde_json::to_string(&method.view(now)).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"has_secret\":true"));
    }

    #[test]
    fn expired_or_inactive_methods_are_not_usable() {
        let now = Utc::now();
        let mut method = IssuedAccess::url(AccessKind::WebUrl, "https://lab/1").attach(now);
        assert!(method.is_usable(now));
        assert!(method.handoff(now).is_some());

        method.expires_at = Some(now - Duration::seconds(1));
        assert!(!method.is_usable(now));
        assert!(method.handoff(now).is_none());
        assert!(!method.view(now).usable);

        method.expires_at = None;
        method.active = false;
        assert!(!method.is_usable(now));
    }
}
