//! Protection key construction.
//!
//! A key is `prefix:dimension:identity:operation`. Two operations share a
//! quota or lock exactly when they produce the same key, so the dimension and
//! identity fragment decide the sharing scope.
//!
//! Identity and operation fragments are percent-escaped: `%` and any
//! character of the separator never appear raw, so distinct fragment lists
//! always produce distinct keys.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{ExpressionEvaluator, RequestContext, ResolverChain};
use crate::error::{ProtectionError, Result};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "apiguard";
/// Default fragment separator.
pub const DEFAULT_SEPARATOR: &str = ":";

/// Marker joining the anonymous tag to a client address in user keys.
const ANONYMOUS_MARKER: char = '@';

/// The scope a quota or lock is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// One bucket per operation id, shared by every caller and every
    /// declaration site using that id
    Global,
    /// Per authenticated user, falling back to client address
    User,
    /// Per client address
    Ip,
    /// Per operation, shared by all callers
    #[default]
    Api,
    /// Identity comes from an evaluated expression
    Custom,
}

impl Dimension {
    /// Tag written into the key.
    pub fn tag(&self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::User => "user",
            Dimension::Ip => "ip",
            Dimension::Api => "api",
            Dimension::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// An opaque, fully qualified store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtectionKey(String);

impl ProtectionKey {
    /// Wrap an already qualified key.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ProtectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProtectionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProtectionKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Builds [`ProtectionKey`]s under a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
    separator: String,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_SEPARATOR)
    }
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: separator.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// A builder whose prefix is extended by `namespace`, used to keep the
    /// rate-limit, idempotency and duplicate keyspaces apart.
    pub fn namespace(&self, namespace: &str) -> Self {
        Self {
            prefix: format!("{}{}{}", self.prefix, self.separator, namespace),
            separator: self.separator.clone(),
        }
    }

    /// Join the fragments into a key, escaping `identity` and `operation_id`.
    pub fn build(&self, dimension: Dimension, identity: &str, operation_id: &str) -> ProtectionKey {
        let identity = self.escape(identity, &[]).into_owned();
        self.join(dimension, &[identity], operation_id)
    }

    /// Percent-escape `%`, the separator's characters and `reserved`.
    pub fn escape<'a>(&self, fragment: &'a str, reserved: &[char]) -> Cow<'a, str> {
        let special = |c: char| c == '%' || self.separator.contains(c) || reserved.contains(&c);
        if !fragment.chars().any(special) {
            return Cow::Borrowed(fragment);
        }

        let mut escaped = String::with_capacity(fragment.len() + 8);
        for c in fragment.chars() {
            if special(c) {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    escaped.push_str(&format!("%{:02X}", byte));
                }
            } else {
                escaped.push(c);
            }
        }
        Cow::Owned(escaped)
    }

    /// `identity` fragments must already be escaped.
    fn join(&self, dimension: Dimension, identity: &[String], operation_id: &str) -> ProtectionKey {
        let sep = &self.separator;
        let mut key = format!("{}{sep}{}", self.prefix, dimension.tag());
        for fragment in identity {
            key.push_str(sep);
            key.push_str(fragment);
        }
        key.push_str(sep);
        key.push_str(&self.escape(operation_id, &[]));
        ProtectionKey(key)
    }

    /// Pattern matching every key under this builder's prefix.
    pub fn prefix_pattern(&self) -> String {
        format!("{}{}", self.prefix, self.separator)
    }

    /// Resolve the identity fragment for a request and build the key.
    ///
    /// `custom_fragment` is the already-evaluated expression output and is
    /// required for [`Dimension::Custom`]; for other dimensions it is appended
    /// as a further fragment to narrow the scope.
    pub fn for_request(
        &self,
        dimension: Dimension,
        operation_id: &str,
        ctx: &RequestContext,
        resolvers: &ResolverChain,
        custom_fragment: Option<&str>,
    ) -> Result<ProtectionKey> {
        let identity = match dimension {
            Dimension::Global => "all".to_string(),
            Dimension::Api => "shared".to_string(),
            Dimension::Ip => self
                .escape(&resolvers.resolve_client_address(ctx), &[])
                .into_owned(),
            // Real identities never carry a raw marker, so they cannot
            // impersonate an anonymous caller's key.
            Dimension::User => match resolvers.resolve_identity(ctx) {
                Some(user) => self.escape(&user, &[ANONYMOUS_MARKER]).into_owned(),
                None => format!(
                    "anonymous{}{}",
                    ANONYMOUS_MARKER,
                    self.escape(&resolvers.resolve_client_address(ctx), &[])
                ),
            },
            Dimension::Custom => {
                let fragment = custom_fragment.filter(|f| !f.is_empty()).ok_or_else(|| {
                    ProtectionError::Configuration(format!(
                        "operation '{}' uses the custom dimension without a key expression",
                        operation_id
                    ))
                })?;
                return Ok(self.build(dimension, fragment, operation_id));
            }
        };

        let mut fragments = vec![identity];
        if let Some(extra) = custom_fragment.filter(|f| !f.is_empty()) {
            fragments.push(self.escape(extra, &[]).into_owned());
        }
        Ok(self.join(dimension, &fragments, operation_id))
    }
}

/// Variables made available to key expressions for a request.
pub fn expression_vars(
    operation_id: &str,
    ctx: &RequestContext,
    resolvers: &ResolverChain,
    args: &[serde_json::Value],
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("operation".to_string(), operation_id.to_string());
    vars.insert("ip".to_string(), resolvers.resolve_client_address(ctx));
    if let Some(user) = resolvers.resolve_identity(ctx) {
        vars.insert("user".to_string(), user);
    }
    for (i, arg) in args.iter().enumerate() {
        let text = match arg {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        vars.insert(format!("args.{}", i), text);
    }
    for (name, value) in &ctx.attributes {
        vars.entry(format!("attr.{}", name)).or_insert_with(|| value.clone());
    }
    vars
}

/// Stable digest of call arguments.
///
/// Uses a name-based (v5) UUID over the JSON encoding so every process
/// derives the same digest for the same arguments.
pub fn hash_arguments(args: &[serde_json::Value]) -> String {
    let encoded = serde_json::Value::Array(args.to_vec()).to_string();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, encoded.as_bytes())
        .simple()
        .to_string()
}

/// How an idempotency key's identity fragment is derived.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "expression")]
pub enum IdempotencyKeySource {
    /// Digest of the call arguments
    ArgumentHash,
    /// Caller identity plus digest of the call arguments
    #[default]
    IdentityArgumentHash,
    /// Externally evaluated expression
    Expression(String),
}

impl IdempotencyKeySource {
    /// Derive the identity fragment for a call.
    pub fn fragment(
        &self,
        operation_id: &str,
        ctx: &RequestContext,
        resolvers: &ResolverChain,
        evaluator: &dyn ExpressionEvaluator,
        args: &[serde_json::Value],
    ) -> Result<String> {
        match self {
            IdempotencyKeySource::ArgumentHash => Ok(hash_arguments(args)),
            IdempotencyKeySource::IdentityArgumentHash => {
                let who = resolvers
                    .resolve_identity(ctx)
                    .unwrap_or_else(|| resolvers.resolve_client_address(ctx));
                Ok(format!("{}.{}", who, hash_arguments(args)))
            }
            IdempotencyKeySource::Expression(expr) => {
                let vars = expression_vars(operation_id, ctx, resolvers, args);
                evaluator.evaluate(expr, &vars)
            }
        }
    }
}
