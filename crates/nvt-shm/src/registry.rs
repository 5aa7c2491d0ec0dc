use nix::errno::Errno;
use tracing::info;

use crate::{Result, ShmError, ShmRegion};

/// Role of this process within the shared-memory namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First process in the group; creates every region and unlinks them on
    /// shutdown.
    Primary,
    /// Attaches to regions the primary already created.
    Secondary,
}

/// Create-or-attach access to a namespace of shared-memory regions.
///
/// Region names are `/{namespace}-{key}`, so cooperating processes agree on
/// the tables by construction and tests isolate themselves with a unique
/// namespace.
pub struct Registry {
    namespace: String,
    role: Role,
    // Dropping the guard last releases the primary claim on shutdown.
    _guard: Option<ShmRegion>,
}

impl Registry {
    /// Opens the namespace, electing this process primary if it is first.
    pub fn open(namespace: &str) -> Result<Self> {
        if namespace.is_empty() || namespace.contains('/') {
            return Err(ShmError::BadNamespace {
                namespace: namespace.to_string(),
            });
        }

        let guard_name = region_name(namespace, "primary");
        match ShmRegion::create_excl(&guard_name, 8) {
            Ok(guard) => {
                info!(namespace, "elected shared-memory primary");
                Ok(Self {
                    namespace: namespace.to_string(),
                    role: Role::Primary,
                    _guard: Some(guard),
                })
            }
            Err(ShmError::Open { source, .. }) if source == Errno::EEXIST => {
                info!(namespace, "joining as shared-memory secondary");
                Ok(Self {
                    namespace: namespace.to_string(),
                    role: Role::Secondary,
                    _guard: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Creates (primary) or attaches to (secondary) the region `key`, sized
    /// `len` bytes.
    pub fn create_or_attach(&self, key: &str, len: u64) -> Result<ShmRegion> {
        let name = region_name(&self.namespace, key);
        match self.role {
            Role::Primary => ShmRegion::create(&name, len),
            Role::Secondary => ShmRegion::attach(&name, len),
        }
    }
}

fn region_name(namespace: &str, key: &str) -> String {
    format!("/{namespace}-{key}")
}
