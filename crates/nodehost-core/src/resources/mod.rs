//! Endpoint and network resources of service package activations.

mod endpoint;
mod network;

pub use endpoint::{EndpointProvider, EndpointResource, EndpointSecurity};
pub use network::{
    parse_assigned_ip, parse_assigned_ips, parse_overlay_assignment, parse_overlay_assignments,
    OverlayAssignment, OverlayAssignments,
};
