//! Request metadata seams.
//!
//! Resolving who is calling and evaluating custom key expressions belong to
//! the surrounding framework. This module only fixes the contracts the
//! protection core consumes, plus small default implementations.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::{ProtectionError, Result};

/// Plain-data view of an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Request headers, keys lower-cased
    pub headers: HashMap<String, String>,
    /// Transport-level peer address
    pub peer_addr: Option<IpAddr>,
    /// Framework-provided attributes (authenticated principal, route, ...)
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header (name is lower-cased).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Set the peer address.
    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Add a framework attribute.
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Resolves the authenticated caller of a request.
pub trait IdentityResolver: Send + Sync {
    /// Resolver order; lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// The caller's user id, if this resolver can determine it.
    fn resolve_identity(&self, ctx: &RequestContext) -> Option<String>;
}

/// Resolves the client network address of a request.
pub trait AddressResolver: Send + Sync {
    /// Resolver order; lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// The client address, if this resolver can determine it.
    fn resolve_client_address(&self, ctx: &RequestContext) -> Option<String>;
}

/// Reads the user id from a framework attribute (e.g. set by auth middleware).
#[derive(Debug, Clone)]
pub struct AttributeIdentityResolver {
    attribute: String,
}

impl AttributeIdentityResolver {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl IdentityResolver for AttributeIdentityResolver {
    fn resolve_identity(&self, ctx: &RequestContext) -> Option<String> {
        ctx.attributes
            .get(&self.attribute)
            .filter(|v| !v.is_empty())
            .cloned()
    }
}

/// Reads the user id from a request header.
#[derive(Debug, Clone)]
pub struct HeaderIdentityResolver {
    header: String,
}

impl HeaderIdentityResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn priority(&self) -> i32 {
        10
    }

    fn resolve_identity(&self, ctx: &RequestContext) -> Option<String> {
        ctx.header(&self.header)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Proxy-aware address resolution: `X-Forwarded-For`, then `X-Real-IP`,
/// then the transport peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedAddressResolver;

impl AddressResolver for ForwardedAddressResolver {
    fn resolve_client_address(&self, ctx: &RequestContext) -> Option<String> {
        if let Some(forwarded) = ctx.header("x-forwarded-for") {
            let first = forwarded.split(',').next().map(str::trim).unwrap_or("");
            if !first.is_empty() && !first.eq_ignore_ascii_case("unknown") {
                return Some(first.to_string());
            }
        }
        if let Some(real_ip) = ctx.header("x-real-ip").map(str::trim) {
            if !real_ip.is_empty() {
                return Some(real_ip.to_string());
            }
        }
        ctx.peer_addr.map(|addr| addr.to_string())
    }
}

/// Priority-ordered chains of identity and address resolvers.
#[derive(Clone, Default)]
pub struct ResolverChain {
    identity: Vec<Arc<dyn IdentityResolver>>,
    address: Vec<Arc<dyn AddressResolver>>,
}

impl std::fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverChain")
            .field("identity", &self.identity.len())
            .field("address", &self.address.len())
            .finish()
    }
}

impl ResolverChain {
    /// Empty chain; resolves nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// The chain used when nothing is configured: `user` attribute,
    /// `x-user-id` header, forwarded address headers.
    pub fn standard() -> Self {
        Self::new()
            .with_identity(AttributeIdentityResolver::new("user"))
            .with_identity(HeaderIdentityResolver::new("x-user-id"))
            .with_address(ForwardedAddressResolver)
    }

    pub fn with_identity(mut self, resolver: impl IdentityResolver + 'static) -> Self {
        self.identity.push(Arc::new(resolver));
        self.identity.sort_by_key(|r| r.priority());
        self
    }

    pub fn with_address(mut self, resolver: impl AddressResolver + 'static) -> Self {
        self.address.push(Arc::new(resolver));
        self.address.sort_by_key(|r| r.priority());
        self
    }

    /// First identity any resolver yields.
    pub fn resolve_identity(&self, ctx: &RequestContext) -> Option<String> {
        self.identity.iter().find_map(|r| r.resolve_identity(ctx))
    }

    /// First address any resolver yields, or `"unknown"`.
    pub fn resolve_client_address(&self, ctx: &RequestContext) -> String {
        self.address
            .iter()
            .find_map(|r| r.resolve_client_address(ctx))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Evaluates custom key expressions.
///
/// Implementations must refuse anything that could execute code or reflect
/// on the host, and bound the input length.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, vars: &HashMap<String, String>) -> Result<String>;
}

/// Maximum accepted expression length.
pub const MAX_EXPRESSION_LEN: usize = 256;

/// `${name}` interpolation over a flat variable map.
///
/// There is no operator or call syntax, so nothing beyond substitution can
/// happen. Unknown variables are an error rather than an empty string, which
/// would silently collapse distinct callers onto one key.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEvaluator;

impl ExpressionEvaluator for TemplateEvaluator {
    fn evaluate(&self, expression: &str, vars: &HashMap<String, String>) -> Result<String> {
        if expression.len() > MAX_EXPRESSION_LEN {
            return Err(ProtectionError::Expression(format!(
                "expression longer than {} characters",
                MAX_EXPRESSION_LEN
            )));
        }

        let mut out = String::with_capacity(expression.len());
        let mut rest = expression;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                ProtectionError::Expression(format!("unterminated placeholder in '{}'", expression))
            })?;
            let name = after[..end].trim();
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                return Err(ProtectionError::Expression(format!(
                    "illegal variable name '{}'",
                    name
                )));
            }
            let value = vars.get(name).ok_or_else(|| {
                ProtectionError::Expression(format!("unknown variable '{}'", name))
            })?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_forwarded_address_precedence() {
        let resolver = ForwardedAddressResolver;
        let ctx = RequestContext::new()
            .with_header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .with_header("X-Real-IP", "198.51.100.2")
            .with_peer("127.0.0.1".parse().unwrap());
        assert_eq!(
            resolver.resolve_client_address(&ctx).as_deref(),
            Some("203.0.113.7")
        );

        let ctx = RequestContext::new().with_peer("127.0.0.1".parse().unwrap());
        assert_eq!(
            resolver.resolve_client_address(&ctx).as_deref(),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn test_identity_chain_priority() {
        let chain = ResolverChain::standard();
        let ctx = RequestContext::new()
            .with_header("x-user-id", "header-user")
            .with_attribute("user", "principal");
        assert_eq!(chain.resolve_identity(&ctx).as_deref(), Some("principal"));

        let ctx = RequestContext::new().with_header("x-user-id", "header-user");
        assert_eq!(chain.resolve_identity(&ctx).as_deref(), Some("header-user"));

        assert_eq!(chain.resolve_identity(&RequestContext::new()), None);
        assert_eq!(chain.resolve_client_address(&RequestContext::new()), "unknown");
    }

    #[test]
    fn test_template_substitution() {
        let eval = TemplateEvaluator;
        let out = eval
            .evaluate("order:${user}:${args.0}", &vars(&[("user", "u1"), ("args.0", "42")]))
            .unwrap();
        assert_eq!(out, "order:u1:42");
        assert_eq!(eval.evaluate("static", &HashMap::new()).unwrap(), "static");
    }

    #[test]
    fn test_template_rejects_bad_input() {
        let eval = TemplateEvaluator;
        assert!(eval.evaluate("${missing}", &HashMap::new()).is_err());
        assert!(eval.evaluate("${user", &vars(&[("user", "u")])).is_err());
        assert!(eval
            .evaluate("${T(java.lang.Runtime).exec('x')}", &HashMap::new())
            .is_err());
        let long = "a".repeat(MAX_EXPRESSION_LEN + 1);
        assert!(eval.evaluate(&long, &HashMap::new()).is_err());
    }
}
