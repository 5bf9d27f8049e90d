//! Endpoint resources and dynamic port allocation.

use crate::error::{HostingError, Result};
use crate::model::{DigestedEndpoint, EndpointDescription, EndpointProtocol, GrantAccessType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

/// Principal granted access to an endpoint's URL reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSecurity {
    pub principal_sid: String,
    pub rights: GrantAccessType,
}

/// One endpoint of a service package activation, as it is persisted in the
/// endpoint descriptor file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointResource {
    pub endpoint: EndpointDescription,
    #[serde(default)]
    pub certificate_ref: String,
    #[serde(default)]
    pub security: Option<EndpointSecurity>,
}

impl EndpointResource {
    pub fn new(digested: &DigestedEndpoint) -> Self {
        Self {
            endpoint: digested.endpoint.clone(),
            certificate_ref: digested.certificate_ref.clone(),
            security: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn is_explicit_port(&self) -> bool {
        self.endpoint.explicit_port_specified
    }

    pub fn is_https(&self) -> bool {
        self.endpoint.protocol == EndpointProtocol::Https
    }

    pub fn set_security(&mut self, principal_sid: impl Into<String>, rights: GrantAccessType) {
        self.security = Some(EndpointSecurity {
            principal_sid: principal_sid.into(),
            rights,
        });
    }

    /// URL reservation prefix, e.g. `http://+:8080/api/`.
    pub fn prefix(&self) -> String {
        let scheme = if self.is_https() { "https" } else { "http" };
        let suffix = self.endpoint.path_suffix.trim_matches('/');
        if suffix.is_empty() {
            format!("{scheme}://+:{}/", self.port())
        } else {
            format!("{scheme}://+:{}/{suffix}/", self.port())
        }
    }
}

// ============================================================================
// Port pool
// ============================================================================

/// Dynamic application ports handed out round-robin from a fixed range.
#[derive(Debug)]
struct PortPool {
    range: RangeInclusive<u16>,
    next: u16,
    allocated: BTreeSet<u16>,
}

impl PortPool {
    fn new(range: RangeInclusive<u16>) -> Self {
        let next = *range.start();
        Self {
            range,
            next,
            allocated: BTreeSet::new(),
        }
    }

    fn capacity(&self) -> usize {
        if self.range.is_empty() {
            0
        } else {
            usize::from(*self.range.end() - *self.range.start()) + 1
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        if self.allocated.len() >= self.capacity() {
            return None;
        }
        loop {
            let candidate = self.next;
            self.next = if candidate >= *self.range.end() {
                *self.range.start()
            } else {
                candidate + 1
            };
            if self.allocated.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    fn release(&mut self, port: u16) -> bool {
        self.allocated.remove(&port)
    }
}

// ============================================================================
// Endpoint provider
// ============================================================================

/// Allocates ports for endpoints that did not declare one.
#[derive(Debug)]
pub struct EndpointProvider {
    enabled: bool,
    pool: Mutex<PortPool>,
}

impl EndpointProvider {
    pub fn new(enabled: bool, range: RangeInclusive<u16>) -> Self {
        Self {
            enabled,
            pool: Mutex::new(PortPool::new(range)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn pool(&self) -> MutexGuard<'_, PortPool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Give `endpoint` a port unless it already has one.
    pub fn add_endpoint(&self, endpoint: &mut EndpointResource) -> Result<()> {
        if !self.enabled {
            return Err(HostingError::EndpointProviderNotEnabled);
        }
        if endpoint.is_explicit_port() || endpoint.port() != 0 {
            return Ok(());
        }

        let port = self.pool().allocate().ok_or_else(|| {
            tracing::error!(endpoint = %endpoint.name(), "Application port range exhausted");
            HostingError::OperationFailed(format!(
                "no free application port for endpoint {}",
                endpoint.name()
            ))
        })?;
        endpoint.endpoint.port = port;
        tracing::debug!(endpoint = %endpoint.name(), port, "Allocated endpoint port");
        Ok(())
    }

    /// Return a dynamically allocated port to the pool.
    pub fn remove_endpoint(&self, endpoint: &EndpointResource) -> Result<()> {
        if !self.enabled {
            return Err(HostingError::EndpointProviderNotEnabled);
        }
        if endpoint.is_explicit_port() {
            return Ok(());
        }
        if self.pool().release(endpoint.port()) {
            tracing::debug!(endpoint = %endpoint.name(), port = endpoint.port(), "Released endpoint port");
        }
        Ok(())
    }

    pub fn allocated_count(&self) -> usize {
        self.pool().allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str, protocol: EndpointProtocol) -> EndpointResource {
        EndpointResource::new(&EndpointDescription::new(name, protocol).into())
    }

    #[test]
    fn test_dynamic_ports_come_from_range() {
        let provider = EndpointProvider::new(true, 100..=101);
        let mut a = resource("A", EndpointProtocol::Tcp);
        let mut b = resource("B", EndpointProtocol::Tcp);
        let mut c = resource("C", EndpointProtocol::Tcp);

        provider.add_endpoint(&mut a).unwrap();
        provider.add_endpoint(&mut b).unwrap();
        assert_eq!((a.port(), b.port()), (100, 101));

        let err = provider.add_endpoint(&mut c).unwrap_err();
        assert!(matches!(err, HostingError::OperationFailed(_)));

        provider.remove_endpoint(&a).unwrap();
        provider.add_endpoint(&mut c).unwrap();
        assert_eq!(c.port(), 100);
        assert_eq!(provider.allocated_count(), 2);
    }

    #[test]
    fn test_explicit_port_is_not_allocated() {
        let provider = EndpointProvider::new(true, 100..=101);
        let mut web = EndpointResource::new(
            &EndpointDescription::new("Web", EndpointProtocol::Http)
                .with_explicit_port(100)
                .into(),
        );
        provider.add_endpoint(&mut web).unwrap();
        assert_eq!(web.port(), 100);
        assert_eq!(provider.allocated_count(), 0);

        provider.remove_endpoint(&web).unwrap();
        assert_eq!(provider.allocated_count(), 0);
    }

    #[test]
    fn test_disabled_provider() {
        let provider = EndpointProvider::new(false, 100..=101);
        let mut a = resource("A", EndpointProtocol::Tcp);
        assert!(matches!(
            provider.add_endpoint(&mut a),
            Err(HostingError::EndpointProviderNotEnabled)
        ));
    }

    #[test]
    fn test_prefix() {
        let mut web = resource("Web", EndpointProtocol::Https);
        web.endpoint.port = 8443;
        assert_eq!(web.prefix(), "https://+:8443/");
        web.endpoint.path_suffix = "/api/".into();
        assert_eq!(web.prefix(), "https://+:8443/api/");
    }
}
