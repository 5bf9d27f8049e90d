//! Network assignments handed back by the node activator.

use crate::error::{HostingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// IP and MAC address a code package received on an overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayAssignment {
    pub ip_address: String,
    pub mac_address: String,
}

fn split_pair<'a>(value: &'a str, what: &str) -> Result<(&'a str, &'a str)> {
    value
        .split_once(',')
        .map(|(a, b)| (a.trim(), b.trim()))
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
        .ok_or_else(|| HostingError::InvalidArgument(format!("malformed {what}: {value}")))
}

/// Parse `"<ip>,<code package>"` into `(code package, ip)`.
pub fn parse_assigned_ip(value: &str) -> Result<(String, String)> {
    let (ip, code_package) = split_pair(value, "assigned ip")?;
    Ok((code_package.to_string(), ip.to_string()))
}

/// Parse every open network assignment, keeping reply order.
pub fn parse_assigned_ips(values: &[String]) -> Result<Vec<(String, String)>> {
    values.iter().map(|v| parse_assigned_ip(v)).collect()
}

/// Parse `"<ip>,<mac>"`.
pub fn parse_overlay_assignment(value: &str) -> Result<OverlayAssignment> {
    let (ip, mac) = split_pair(value, "overlay assignment")?;
    Ok(OverlayAssignment {
        ip_address: ip.to_string(),
        mac_address: mac.to_string(),
    })
}

/// Network name to code package to assignment.
pub type OverlayAssignments = BTreeMap<String, BTreeMap<String, OverlayAssignment>>;

pub fn parse_overlay_assignments(
    reply: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<OverlayAssignments> {
    let mut parsed = OverlayAssignments::new();
    for (network, code_packages) in reply {
        let entry = parsed.entry(network.clone()).or_default();
        for (code_package, value) in code_packages {
            entry.insert(code_package.clone(), parse_overlay_assignment(value)?);
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assigned_ips() {
        let parsed = parse_assigned_ips(&["10.0.0.4,Front".into(), "10.0.0.5, Back".into()]).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("Front".to_string(), "10.0.0.4".to_string()),
                ("Back".to_string(), "10.0.0.5".to_string())
            ]
        );
        assert!(parse_assigned_ip("10.0.0.4").is_err());
        assert!(parse_assigned_ip(",Front").is_err());
    }

    #[test]
    fn test_parse_overlay_assignments() {
        let mut reply = BTreeMap::new();
        reply.insert(
            "appnet".to_string(),
            BTreeMap::from([("Front".to_string(), "172.16.0.2,00-15-5D-00-00-01".to_string())]),
        );
        let parsed = parse_overlay_assignments(&reply).unwrap();
        assert_eq!(parsed["appnet"]["Front"].mac_address, "00-15-5D-00-00-01");

        reply.insert(
            "bad".to_string(),
            BTreeMap::from([("Back".to_string(), "nope".to_string())]),
        );
        assert!(parse_overlay_assignments(&reply).is_err());
    }
}
