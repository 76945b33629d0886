//! Authorization filter pipeline (C6).
//!
//! Runs once per inbound `Request`/`AsyncEnumerableRequest`, before dispatch
//! reaches the invoker. Rules are evaluated in a fixed order (§4.6); the
//! first rule that applies decides the call, falling through to the
//! configured default policy if none do.

use crate::config::{DefaultPolicy, RpcConfig};
use crate::message::{Identity, Role};

/// A single method-level authorization requirement, attached to an
/// interface method the way an attribute would be in the source this
/// protocol serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodPolicy {
    /// No restriction: anonymous callers may invoke this method.
    AllowAnonymous,
    /// Only callers authenticated with [`Role::Server`] may invoke this.
    ServerOnly,
    /// Caller must be authenticated with at least this role.
    RequireRole(Role),
    /// Caller must be authenticated (any non-anonymous role).
    Authorize,
    /// Method is reachable from non-server clients at all; combined with
    /// `enforce_client_accessible` to reject server-internal methods a
    /// client tries to call directly.
    ClientAccessible,
}

/// The decision the authorization filter reaches for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny { reason: String },
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow)
    }
}

/// Everything the filter needs to know about one call.
#[derive(Debug, Clone)]
pub struct AuthContext<'a> {
    pub identity: &'a Identity,
    pub policies: &'a [MethodPolicy],
    pub is_server_to_server: bool,
    pub method: &'a str,
    pub interface: &'a str,
}

/// Evaluates the ordered rule set from §4.6 against one call.
///
/// Order: disabled authorization short-circuits to allow; `AllowAnonymous`
/// always allows; strict client-accessible enforcement rejects unmarked
/// methods called by non-server callers; `ServerOnly` rejects non-server
/// callers; `RequireRole` checks the caller's role against the minimum;
/// `Authorize` rejects anonymous callers; anything left falls through to
/// the configured default policy.
pub fn authorize(config: &RpcConfig, ctx: &AuthContext) -> AuthDecision {
    if !config.enable_authorization {
        return AuthDecision::Allow;
    }

    if ctx.policies.contains(&MethodPolicy::AllowAnonymous) {
        return AuthDecision::Allow;
    }

    if config.enforce_client_accessible
        && ctx.identity.role != Role::Server
        && !ctx.policies.contains(&MethodPolicy::ClientAccessible)
    {
        return deny(ctx, "ClientAccessible", "method is not reachable from a client connection");
    }

    if ctx.policies.contains(&MethodPolicy::ServerOnly) {
        return if ctx.identity.role == Role::Server {
            AuthDecision::Allow
        } else {
            deny(ctx, "ServerOnly", "caller is not an authenticated server")
        };
    }

    if let Some(MethodPolicy::RequireRole(min_role)) = ctx
        .policies
        .iter()
        .find(|p| matches!(p, MethodPolicy::RequireRole(_)))
    {
        return if ctx.identity.role >= *min_role {
            AuthDecision::Allow
        } else {
            deny(
                ctx,
                "RequireRole",
                &format!("caller role {:?} below required {:?}", ctx.identity.role, min_role),
            )
        };
    }

    if ctx.policies.contains(&MethodPolicy::Authorize) {
        return if ctx.identity.is_anonymous() {
            deny(ctx, "Authorize", "caller is anonymous")
        } else {
            AuthDecision::Allow
        };
    }

    match config.default_policy {
        DefaultPolicy::AllowAnonymous => AuthDecision::Allow,
        DefaultPolicy::RequireAuthentication => {
            if ctx.identity.is_anonymous() {
                deny(ctx, "DefaultPolicy", "no matching rule, default policy requires authentication")
            } else {
                AuthDecision::Allow
            }
        }
    }
}

fn deny(ctx: &AuthContext, deciding_rule: &str, reason: &str) -> AuthDecision {
    tracing::debug!(
        interface = ctx.interface,
        method = ctx.method,
        user_id = %anonymized_user_id(ctx.identity),
        deciding_rule,
        reason,
        "authorization denied"
    );
    AuthDecision::Deny {
        reason: reason.to_string(),
    }
}

/// Never logs a raw user id; callers outside test code should rely on this
/// rather than `identity.user_id` directly in structured logs.
fn anonymized_user_id(identity: &Identity) -> String {
    if identity.is_anonymous() {
        return "anonymous".to_string();
    }
    let digest = identity
        .user_id
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    format!("u{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: "user-1".into(),
            user_name: "Test User".into(),
            role,
        }
    }

    fn ctx<'a>(identity: &'a Identity, policies: &'a [MethodPolicy]) -> AuthContext<'a> {
        AuthContext {
            identity,
            policies,
            is_server_to_server: false,
            method: "DoThing",
            interface: "ITest",
        }
    }

    #[test]
    fn auth_disabled_allows_everything() {
        let mut config = RpcConfig::default();
        config.enable_authorization = false;
        let id = identity(Role::Anonymous);
        let decision = authorize(&config, &ctx(&id, &[MethodPolicy::ServerOnly]));
        assert_eq!(decision, AuthDecision::Allow);
    }

    #[test]
    fn allow_anonymous_lets_anonymous_through() {
        let config = RpcConfig::default();
        let id = identity(Role::Anonymous);
        let decision = authorize(&config, &ctx(&id, &[MethodPolicy::AllowAnonymous]));
        assert!(decision.is_allowed());
    }

    #[test]
    fn server_only_rejects_non_server_identity() {
        let config = RpcConfig::default();
        let id = identity(Role::Admin);
        let decision = authorize(&config, &ctx(&id, &[MethodPolicy::ServerOnly]));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn server_only_allows_server_identity() {
        let config = RpcConfig::default();
        let id = identity(Role::Server);
        let decision = authorize(&config, &ctx(&id, &[MethodPolicy::ServerOnly]));
        assert!(decision.is_allowed());
    }

    #[test]
    fn require_role_compares_against_minimum() {
        let config = RpcConfig::default();
        let guest = identity(Role::Guest);
        let admin = identity(Role::Admin);
        let policies = [MethodPolicy::RequireRole(Role::User)];
        assert!(!authorize(&config, &ctx(&guest, &policies)).is_allowed());
        assert!(authorize(&config, &ctx(&admin, &policies)).is_allowed());
    }

    #[test]
    fn authorize_rejects_anonymous_only() {
        let config = RpcConfig::default();
        let anon = identity(Role::Anonymous);
        let user = identity(Role::User);
        let policies = [MethodPolicy::Authorize];
        assert!(!authorize(&config, &ctx(&anon, &policies)).is_allowed());
        assert!(authorize(&config, &ctx(&user, &policies)).is_allowed());
    }

    #[test]
    fn default_policy_governs_unmarked_methods() {
        let mut config = RpcConfig::default();
        let anon = identity(Role::Anonymous);
        let user = identity(Role::User);
        config.default_policy = DefaultPolicy::RequireAuthentication;
        assert!(!authorize(&config, &ctx(&anon, &[])).is_allowed());
        assert!(authorize(&config, &ctx(&user, &[])).is_allowed());
        config.default_policy = DefaultPolicy::AllowAnonymous;
        assert!(authorize(&config, &ctx(&anon, &[])).is_allowed());
    }

    #[test]
    fn client_accessible_overrides_server_only_enforcement() {
        let mut config = RpcConfig::default();
        config.enforce_client_accessible = true;
        let id = identity(Role::Server);
        let policies = [MethodPolicy::ServerOnly, MethodPolicy::ClientAccessible];
        let mut call_ctx = ctx(&id, &policies);
        call_ctx.is_server_to_server = false;
        // ServerOnly still requires a server identity even when client-accessible.
        assert!(authorize(&config, &call_ctx).is_allowed());
    }

    #[test]
    fn strict_client_accessible_denies_unmarked_method_for_non_server_caller() {
        let mut config = RpcConfig::default();
        config.enforce_client_accessible = true;
        let user = identity(Role::User);
        // Neither ServerOnly nor ClientAccessible: strict mode must deny a
        // non-server caller rather than fall through to the default policy.
        let decision = authorize(&config, &ctx(&user, &[]));
        assert!(!decision.is_allowed());

        // A method explicitly marked ClientAccessible is unaffected.
        let policies = [MethodPolicy::ClientAccessible];
        assert!(authorize(&config, &ctx(&user, &policies)).is_allowed());
    }
}
