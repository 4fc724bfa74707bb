//! The execution context propagated with every call to the Runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifacts::uuid_id;
use crate::proto;

uuid_id! {
    /// Identifies a microservice.
    MicroserviceId
}

uuid_id! {
    /// Identifies a tenant.
    TenantId
}

uuid_id! {
    /// Correlates the calls belonging to one logical operation.
    CorrelationId
}

impl TenantId {
    /// The tenant used for system-level operations.
    pub const SYSTEM: TenantId =
        TenantId(uuid::Uuid::from_u128(0x08831584_e016_42f6_bc5e_c6f28ef3c3ff));
    /// The tenant used while developing locally.
    pub const DEVELOPMENT: TenantId =
        TenantId(uuid::Uuid::from_u128(0x445f8ea8_1a6f_40d7_b2fc_796dba92dc44));
}

/// Semantic version of a microservice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
    /// Empty for releases.
    pub pre_release: String,
}

impl Version {
    /// A release version `major.minor.patch`.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            ..Self::default()
        }
    }

    /// Set the build number.
    pub fn with_build(mut self, build: u32) -> Self {
        self.build = build;
        self
    }

    /// Set the pre-release tag.
    pub fn with_pre_release(mut self, pre_release: impl Into<String>) -> Self {
        self.pre_release = pre_release.into();
        self
    }

    pub(crate) fn to_proto(&self) -> proto::Version {
        proto::Version {
            major: self.major,
            minor: self.minor,
            patch: self.patch,
            build: self.build,
            pre_release: self.pre_release.clone(),
        }
    }

    pub(crate) fn from_proto(version: &proto::Version) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
            patch: version.patch,
            build: version.build,
            pre_release: version.pre_release.clone(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre_release.is_empty() {
            write!(f, "-{}", self.pre_release)?;
        }
        if self.build != 0 {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

/// The environment a microservice runs in, e.g. "Development".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(String);

impl Environment {
    /// An environment name, e.g. `"Production"`.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new("Development")
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single claim about the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub key: String,
    pub value: String,
    pub value_type: String,
}

impl Claim {
    /// A claim with its key, value and value type.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        value_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type: value_type.into(),
        }
    }
}

/// An ordered set of claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Vec<Claim>);

impl Claims {
    /// Iterate the claims in the order they were given.
    pub fn iter(&self) -> std::slice::Iter<'_, Claim> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<Claim>> for Claims {
    fn from(claims: Vec<Claim>) -> Self {
        Self(claims)
    }
}

impl FromIterator<Claim> for Claims {
    fn from_iter<I: IntoIterator<Item = Claim>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Claims {
    type Item = &'a Claim;
    type IntoIter = std::slice::Iter<'a, Claim>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Identity of a call: who is calling, on behalf of which tenant, as part of
/// which correlated operation.
///
/// Immutable. The `for_*` methods return modified copies.
///
/// # Examples
///
/// ```
/// use eventfold_sdk::{ExecutionContext, TenantId};
///
/// let base = ExecutionContext::default();
/// let tenant = TenantId::new_random();
/// let scoped = base.for_tenant(tenant);
///
/// assert_eq!(scoped.tenant_id(), tenant);
/// assert_eq!(base.tenant_id(), TenantId::SYSTEM);
/// assert_eq!(scoped.correlation_id(), base.correlation_id());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    microservice_id: MicroserviceId,
    tenant_id: TenantId,
    version: Version,
    environment: Environment,
    correlation_id: CorrelationId,
    claims: Claims,
}

impl Default for ExecutionContext {
    /// System tenant, nil microservice, fresh correlation id, no claims.
    fn default() -> Self {
        Self::new(
            MicroserviceId::from_uuid(uuid::Uuid::nil()),
            TenantId::SYSTEM,
            Version::default(),
            Environment::default(),
            CorrelationId::new_random(),
            Claims::default(),
        )
    }
}

impl ExecutionContext {
    /// A context from all of its parts.
    ///
    /// Most callers start from [`for_microservice`](ExecutionContext::for_microservice)
    /// and narrow it with the `for_*` methods instead.
    pub fn new(
        microservice_id: MicroserviceId,
        tenant_id: TenantId,
        version: Version,
        environment: Environment,
        correlation_id: CorrelationId,
        claims: Claims,
    ) -> Self {
        Self {
            microservice_id,
            tenant_id,
            version,
            environment,
            correlation_id,
            claims,
        }
    }

    /// The context a microservice starts from: system tenant, fresh
    /// correlation id and no claims.
    pub fn for_microservice(
        microservice_id: MicroserviceId,
        version: Version,
        environment: Environment,
    ) -> Self {
        Self::new(
            microservice_id,
            TenantId::SYSTEM,
            version,
            environment,
            CorrelationId::new_random(),
            Claims::default(),
        )
    }

    /// The microservice the call originates from.
    pub fn microservice_id(&self) -> MicroserviceId {
        self.microservice_id
    }

    /// The tenant the call acts for.
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Version of the calling microservice.
    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Correlates the calls of one logical operation.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Claims of the caller, adopted from incoming requests.
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// A copy acting on behalf of `tenant_id`.
    pub fn for_tenant(&self, tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            ..self.clone()
        }
    }

    /// A copy correlated with `correlation_id`.
    pub fn for_correlation(&self, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            ..self.clone()
        }
    }

    /// A copy carrying `claims` instead of the current ones.
    pub fn for_claims(&self, claims: Claims) -> Self {
        Self {
            claims,
            ..self.clone()
        }
    }

    pub(crate) fn to_proto(&self) -> proto::ExecutionContext {
        proto::ExecutionContext {
            microservice_id: self.microservice_id.to_string(),
            tenant_id: self.tenant_id.to_string(),
            version: Some(self.version.to_proto()),
            correlation_id: self.correlation_id.to_string(),
            claims: self
                .claims
                .iter()
                .map(|claim| proto::Claim {
                    key: claim.key.clone(),
                    value: claim.value.clone(),
                    value_type: claim.value_type.clone(),
                })
                .collect(),
            environment: self.environment.0.clone(),
        }
    }

    /// Decode a wire context. Returns `None` if any id is not a valid UUID.
    pub(crate) fn from_proto(context: &proto::ExecutionContext) -> Option<Self> {
        Some(Self {
            microservice_id: context.microservice_id.parse().ok()?,
            tenant_id: context.tenant_id.parse().ok()?,
            version: context
                .version
                .as_ref()
                .map(Version::from_proto)
                .unwrap_or_default(),
            environment: Environment::new(context.environment.clone()),
            correlation_id: context.correlation_id.parse().ok()?,
            claims: context
                .claims
                .iter()
                .map(|claim| Claim::new(&claim.key, &claim.value, &claim.value_type))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExecutionContext {
        ExecutionContext::new(
            MicroserviceId::new_random(),
            TenantId::DEVELOPMENT,
            Version::new(1, 2, 3).with_build(7).with_pre_release("beta"),
            Environment::new("Production"),
            CorrelationId::new_random(),
            Claims::from(vec![Claim::new("role", "chef", "string")]),
        )
    }

    #[test]
    fn for_tenant_only_changes_tenant() {
        let base = sample();
        let tenant = TenantId::new_random();
        let scoped = base.for_tenant(tenant);

        assert_eq!(scoped.tenant_id(), tenant);
        assert_eq!(scoped.microservice_id(), base.microservice_id());
        assert_eq!(scoped.correlation_id(), base.correlation_id());
        assert_eq!(scoped.claims(), base.claims());
        assert_eq!(base.tenant_id(), TenantId::DEVELOPMENT);
    }

    #[test]
    fn for_claims_replaces_claims() {
        let base = sample();
        let scoped = base.for_claims(Claims::default());
        assert!(scoped.claims().is_empty());
        assert_eq!(base.claims().len(), 1);
    }

    #[test]
    fn for_correlation_replaces_correlation() {
        let base = sample();
        let correlation = CorrelationId::new_random();
        assert_eq!(
            base.for_correlation(correlation).correlation_id(),
            correlation
        );
    }

    #[test]
    fn proto_conversion_preserves_every_field() {
        let context = sample();
        let decoded = ExecutionContext::from_proto(&context.to_proto()).unwrap();
        assert_eq!(decoded, context);
    }

    #[test]
    fn from_proto_rejects_invalid_ids() {
        let mut wire = sample().to_proto();
        wire.tenant_id = "not-a-tenant".into();
        assert!(ExecutionContext::from_proto(&wire).is_none());
    }

    #[test]
    fn version_display() {
        assert_eq!(Version::new(1, 2, 3).to_string(), "1.2.3");
        assert_eq!(
            Version::new(1, 2, 3)
                .with_pre_release("rc1")
                .with_build(4)
                .to_string(),
            "1.2.3-rc1+4"
        );
    }

    #[test]
    fn serde_roundtrip() {
        let context = sample();
        let json = serde_json::to_string(&context).unwrap();
        let back: ExecutionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, context);
    }
}
