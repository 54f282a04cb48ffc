//! Remote collaborators.
//!
//! The engine never talks to a backend directly. It reads raw wire bodies
//! through a [`StateSource`] and issues single mutation calls through a
//! [`StateMutator`]. Both are injected, so tests use [`MemoryRemote`].

mod memory;

pub use memory::MemoryRemote;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, RemoteError, Result};
use crate::kind::SubResourceKind;
use crate::model::{DhcpOptions, LoggingConfig, TagMap, VersioningStatus, WebsiteConfig};

/// Reads the current wire body of one sub-resource kind.
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Fetch the raw body of `kind` on `resource`.
    ///
    /// A resource or sub-resource that does not exist is reported as
    /// [`RemoteError::NotFound`].
    async fn fetch(&self, resource: &str, kind: SubResourceKind) -> std::result::Result<Value, RemoteError>;
}

/// Issues one mutation call against the remote.
#[async_trait]
pub trait StateMutator: Send + Sync {
    async fn apply(
        &self,
        resource: &str,
        kind: SubResourceKind,
        mutation: &Mutation,
    ) -> std::result::Result<(), RemoteError>;
}

/// A single remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateResource,
    DeleteResource {
        /// Empty the resource's contents first.
        force: bool,
    },
    SetVersioning {
        status: VersioningStatus,
    },
    SetRequesterPays {
        enabled: bool,
    },
    PutPolicy {
        document: Value,
    },
    DeletePolicy,
    PutTags {
        tags: TagMap,
    },
    DeleteTags,
    PutWebsite {
        config: WebsiteConfig,
    },
    DeleteWebsite,
    PutLogging {
        config: LoggingConfig,
    },
    DeleteLogging,
    PutDhcpOptions {
        options: DhcpOptions,
    },
    DeleteDhcpOptions,
    PutAssumeRolePolicy {
        document: Value,
    },
    AttachPolicy {
        arn: String,
    },
    DetachPolicy {
        arn: String,
    },
    /// Write the whole rule collection in one call.
    ReplaceRules {
        rules: Vec<Value>,
    },
    DeleteRules,
    /// Create one rule, optionally removing the rule it supersedes.
    PutRule {
        rule: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replaces: Option<Value>,
    },
    DeleteRule {
        rule: Value,
    },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateResource => "create_resource",
            Mutation::DeleteResource { .. } => "delete_resource",
            Mutation::SetVersioning { .. } => "set_versioning",
            Mutation::SetRequesterPays { .. } => "set_requester_pays",
            Mutation::PutPolicy { .. } => "put_policy",
            Mutation::DeletePolicy => "delete_policy",
            Mutation::PutTags { .. } => "put_tags",
            Mutation::DeleteTags => "delete_tags",
            Mutation::PutWebsite { .. } => "put_website",
            Mutation::DeleteWebsite => "delete_website",
            Mutation::PutLogging { .. } => "put_logging",
            Mutation::DeleteLogging => "delete_logging",
            Mutation::PutDhcpOptions { .. } => "put_dhcp_options",
            Mutation::DeleteDhcpOptions => "delete_dhcp_options",
            Mutation::PutAssumeRolePolicy { .. } => "put_assume_role_policy",
            Mutation::AttachPolicy { .. } => "attach_policy",
            Mutation::DetachPolicy { .. } => "detach_policy",
            Mutation::ReplaceRules { .. } => "replace_rules",
            Mutation::DeleteRules => "delete_rules",
            Mutation::PutRule { .. } => "put_rule",
            Mutation::DeleteRule { .. } => "delete_rule",
        }
    }
}

/// Run a remote call under a deadline, mapping expiry to [`Error::Timeout`].
pub(crate) async fn with_deadline<T, F>(
    operation: impl FnOnce() -> String,
    after: Duration,
    call: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, RemoteError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout {
            operation: operation(),
            after,
        }),
    }
}

/// Fetch one kind, treating a missing sub-resource as `None`.
pub(crate) async fn fetch_optional(
    source: &dyn StateSource,
    resource: &str,
    kind: SubResourceKind,
    after: Duration,
) -> Result<Option<Value>> {
    let call = async {
        match source.fetch(resource, kind).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    };
    with_deadline(|| format!("fetch {} {}", resource, kind), after, call).await
}
