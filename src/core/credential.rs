// src/core/credential.rs

//! Credential types and the cache key that decides connection sharing.

use crate::core::errors::HubMuxError;
use bitflags::bitflags;
use std::fmt;
use url::Url;

bitflags! {
    /// Access rights requested when authorizing a session or link.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessRights: u8 {
        const REGISTRY_READ = 1;
        const REGISTRY_WRITE = 1 << 1;
        const SERVICE_CONNECT = 1 << 2;
        const DEVICE_CONNECT = 1 << 3;
    }
}

impl AccessRights {
    /// Renders the rights as the string array the token wire format expects.
    pub fn as_strings(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(AccessRights::REGISTRY_READ) {
            out.push("RegistryRead");
        }
        if self.contains(AccessRights::REGISTRY_WRITE) {
            out.push("RegistryWrite");
        }
        if self.contains(AccessRights::SERVICE_CONNECT) {
            out.push("ServiceConnect");
        }
        if self.contains(AccessRights::DEVICE_CONNECT) {
            out.push("DeviceConnect");
        }
        out
    }
}

/// How a credential proves itself to the hub.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// A shared-access key, optionally bound to a named hub-level policy.
    /// A missing policy name marks the credential as device-scoped.
    SharedAccessKey {
        policy_name: Option<String>,
        key: String,
    },
    /// A pre-built shared-access signature.
    SharedAccessSignature { signature: String },
}

// Key material must never reach logs.
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::SharedAccessKey { policy_name, .. } => f
                .debug_struct("SharedAccessKey")
                .field("policy_name", policy_name)
                .field("key", &"<redacted>")
                .finish(),
            AuthMethod::SharedAccessSignature { .. } => f
                .debug_struct("SharedAccessSignature")
                .field("signature", &"<redacted>")
                .finish(),
        }
    }
}

/// A fully resolved credential for one hub, and optionally one device.
/// Parsing connection strings into this shape happens outside this crate.
#[derive(Debug, Clone)]
pub struct Credential {
    pub host_name: String,
    pub endpoint: Url,
    pub device_id: Option<String>,
    pub auth: AuthMethod,
}

impl Credential {
    /// True when the credential carries a hub-level shared-access policy,
    /// i.e. the resulting connection may be shared across callers directly.
    pub fn is_hub_scope(&self) -> bool {
        matches!(
            &self.auth,
            AuthMethod::SharedAccessKey {
                policy_name: Some(_),
                ..
            }
        )
    }

    /// The cache key this credential maps to. Deliberately excludes the
    /// device identity so that devices sharing a hub-level policy share one
    /// key, and thus one connection.
    pub fn key(&self) -> CredentialKey {
        CredentialKey {
            host_name: self.host_name.clone(),
            endpoint: self.endpoint.to_string(),
            auth: self.auth.clone(),
        }
    }

    /// Absolute address for a link attached at `path`.
    pub fn link_address(&self, path: &str) -> Result<Url, HubMuxError> {
        Ok(self.endpoint.join(path.trim_start_matches('/'))?)
    }

    /// The audience a token for `path` must be scoped to.
    pub fn audience_for(&self, path: &str) -> String {
        let base = self.endpoint.as_str().trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// The resource URI tokens are issued against.
    pub fn resource(&self) -> String {
        self.endpoint.to_string()
    }

    /// This credential's device identity as a url-encoded path segment.
    pub fn encoded_device_id(&self) -> Option<String> {
        self.device_id
            .as_deref()
            .map(|d| urlencoding::encode(d).into_owned())
    }
}

/// Identifies connections that are interchangeable for sharing: two equal
/// keys may always be served by the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    host_name: String,
    endpoint: String,
    auth: AuthMethod,
}

impl CredentialKey {
    pub fn host_name(&self) -> &str {
        &self.host_name
    }
}
