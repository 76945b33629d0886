//! Routing strategies (C5): pure selection logic over a snapshot of known
//! servers. The connection manager owns the live server map and takes the
//! copy-on-write snapshot; this module only decides which server id a
//! request should go to given that snapshot.

use crate::message::{Health, ServerDescriptor};

/// Input available to a routing decision: the full set of known servers
/// plus the request's own routing hints.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub target_zone_id: Option<&'a str>,
    pub grain_type: Option<&'a str>,
}

/// A server selection strategy. Implementations must be deterministic given
/// the same snapshot and request so retried calls are reproducible in
/// tests.
pub trait RoutingStrategy: Send + Sync {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        zone_to_server: &std::collections::HashMap<String, String>,
        request: &RouteRequest,
    ) -> Option<&'a ServerDescriptor>;
}

/// Routes to an explicit server id carried on the request itself. Used when
/// a caller already knows which server owns the grain (e.g. a follow-up
/// call on the same connection).
pub struct ExplicitTarget<'a>(pub &'a str);

impl RoutingStrategy for ExplicitTarget<'_> {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        _zone_to_server: &std::collections::HashMap<String, String>,
        _request: &RouteRequest,
    ) -> Option<&'a ServerDescriptor> {
        servers
            .iter()
            .find(|s| s.server_id == self.0 && s.health.is_routable())
    }
}

/// Routes by zone, using the handshake-provided `zone_to_server_map`.
pub struct ZoneAwareGrain;

impl RoutingStrategy for ZoneAwareGrain {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        zone_to_server: &std::collections::HashMap<String, String>,
        request: &RouteRequest,
    ) -> Option<&'a ServerDescriptor> {
        let zone = request.target_zone_id?;
        let server_id = zone_to_server.get(zone)?;
        servers
            .iter()
            .find(|s| &s.server_id == server_id && s.health.is_routable())
    }
}

/// Routes by matching server metadata against a grain-type pattern
/// (`metadata["grain_types"]` containing the requested grain type, or `*`).
/// Among matches, picks the healthiest server and breaks remaining ties
/// lexicographically by `server_id`.
pub struct GrainTypePattern;

impl RoutingStrategy for GrainTypePattern {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        _zone_to_server: &std::collections::HashMap<String, String>,
        request: &RouteRequest,
    ) -> Option<&'a ServerDescriptor> {
        let grain_type = request.grain_type?;
        let mut candidates: Vec<&ServerDescriptor> = servers
            .iter()
            .filter(|s| s.health.is_routable())
            .filter(|s| match s.metadata.get("grain_types") {
                Some(pattern) => pattern == "*" || pattern.split(',').any(|p| p == grain_type),
                None => false,
            })
            .collect();
        candidates.sort_by(|a, b| health_rank(a.health).cmp(&health_rank(b.health)).then(a.server_id.cmp(&b.server_id)));
        candidates.into_iter().next()
    }
}

/// Routes to the server flagged `is_primary`, breaking ties (should not
/// normally occur) lexicographically.
pub struct Primary;

impl RoutingStrategy for Primary {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        _zone_to_server: &std::collections::HashMap<String, String>,
        _request: &RouteRequest,
    ) -> Option<&'a ServerDescriptor> {
        let mut candidates: Vec<&ServerDescriptor> = servers
            .iter()
            .filter(|s| s.is_primary && s.health.is_routable())
            .collect();
        candidates.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        candidates.into_iter().next()
    }
}

/// Routes to any healthy server, preferring `Healthy` over `Degraded` and
/// breaking ties lexicographically by `server_id` for determinism.
pub struct AnyHealthy;

impl RoutingStrategy for AnyHealthy {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        _zone_to_server: &std::collections::HashMap<String, String>,
        _request: &RouteRequest,
    ) -> Option<&'a ServerDescriptor> {
        let mut candidates: Vec<&ServerDescriptor> =
            servers.iter().filter(|s| s.health.is_routable()).collect();
        candidates.sort_by(|a, b| health_rank(a.health).cmp(&health_rank(b.health)).then(a.server_id.cmp(&b.server_id)));
        candidates.into_iter().next()
    }
}

fn health_rank(h: Health) -> u8 {
    match h {
        Health::Healthy => 0,
        Health::Degraded => 1,
        Health::Unhealthy => 2,
        Health::Offline => 3,
    }
}

/// Tries each strategy in order, returning the first match. This is what a
/// connection manager actually holds: explicit target, then zone awareness,
/// then grain-type pattern, then primary, then any healthy server.
pub struct CompositeRouter {
    strategies: Vec<Box<dyn RoutingStrategy>>,
}

impl CompositeRouter {
    pub fn new(strategies: Vec<Box<dyn RoutingStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn default_chain() -> Self {
        Self::new(vec![
            Box::new(ZoneAwareGrain),
            Box::new(GrainTypePattern),
            Box::new(Primary),
            Box::new(AnyHealthy),
        ])
    }

    pub fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        zone_to_server: &std::collections::HashMap<String, String>,
        request: &RouteRequest,
    ) -> Option<&'a ServerDescriptor> {
        self.strategies
            .iter()
            .find_map(|s| s.select(servers, zone_to_server, request))
    }
}
