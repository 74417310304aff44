//! CF-028: Access entry stacks.
//!
//! One stack per principal, so entries can be added and removed without
//! touching the cluster stack.

use super::TEMPLATE_DESCRIPTION_SUFFIX;
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet};
use crate::core::types::{AccessEntry, AccessPolicy, ClusterConfig};
use crate::error::{Error, Result};

pub const ACCESS_ENTRY_RESOURCE: &str = "AccessEntry";

const SCOPE_CLUSTER: &str = "cluster";
const SCOPE_NAMESPACE: &str = "namespace";

fn access_policy(entry: &AccessEntry, policy: &AccessPolicy) -> Result<Value> {
    let scope = &policy.access_scope;
    match scope.scope_type.as_str() {
        SCOPE_CLUSTER if !scope.namespaces.is_empty() => {
            return Err(Error::invalid_config(format!(
                "access entry {}: policy {} has cluster scope but lists namespaces",
                entry.principal_arn, policy.policy_arn
            )));
        }
        SCOPE_NAMESPACE if scope.namespaces.is_empty() => {
            return Err(Error::missing_field(
                "accessScope.namespaces",
                format!("namespace-scoped policy {}", policy.policy_arn),
            ));
        }
        SCOPE_CLUSTER | SCOPE_NAMESPACE => {}
        other => {
            return Err(Error::invalid_config(format!(
                "access entry {}: unknown access scope type {:?} (expected cluster or namespace)",
                entry.principal_arn, other
            )));
        }
    }
    let mut access_scope = vec![("Type", Value::from(scope.scope_type.as_str()))];
    if !scope.namespaces.is_empty() {
        access_scope.push(("Namespaces", Value::strings(scope.namespaces.iter().cloned())));
    }
    Ok(Value::object([
        ("PolicyArn", Value::from(policy.policy_arn.as_str())),
        ("AccessScope", Value::object(access_scope)),
    ]))
}

/// Stack holding a single `AWS::EKS::AccessEntry`.
pub fn build_access_entry_stack(cfg: &ClusterConfig, entry: &AccessEntry) -> Result<ResourceSet> {
    if entry.principal_arn.is_empty() {
        return Err(Error::missing_field("principalARN", "an access entry"));
    }
    let policies = entry
        .access_policies
        .iter()
        .map(|p| access_policy(entry, p))
        .collect::<Result<Vec<_>>>()?;

    let mut rs = ResourceSet::new(format!(
        "EKS access entry for {} {}",
        entry.principal_arn, TEMPLATE_DESCRIPTION_SUFFIX
    ));
    let mut resource = Resource::new(ResourceKind::EksAccessEntry)
        .with("ClusterName", cfg.metadata.name.as_str())
        .with("PrincipalArn", entry.principal_arn.as_str())
        .with_opt("Username", entry.kubernetes_username.as_deref())
        .with_opt("Type", entry.entry_type.as_deref());
    if !entry.kubernetes_groups.is_empty() {
        resource = resource.with(
            "KubernetesGroups",
            Value::strings(entry.kubernetes_groups.iter().cloned()),
        );
    }
    if !policies.is_empty() {
        resource = resource.with("AccessPolicies", Value::list(policies));
    }
    rs.add_resource(ACCESS_ENTRY_RESOURCE, resource)?;
    Ok(rs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_config;

    fn config() -> ClusterConfig {
        parse_config(
            r#"
metadata:
  name: demo
  region: us-west-2
accessEntries:
  - principalARN: arn:aws:iam::111122223333:role/admin
    kubernetesGroups: [ops]
    kubernetesUsername: admin
    accessPolicies:
      - policyARN: arn:aws:eks::aws:cluster-access-policy/AmazonEKSViewPolicy
        accessScope:
          type: namespace
          namespaces: [default, kube-system]
      - policyARN: arn:aws:eks::aws:cluster-access-policy/AmazonEKSAdminPolicy
        accessScope:
          type: cluster
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_cf028_access_entry_resource() {
        let cfg = config();
        let rs = build_access_entry_stack(&cfg, &cfg.access_entries[0]).unwrap();
        let json = rs.finish().unwrap().to_json().unwrap();
        let entry = &json["Resources"]["AccessEntry"];
        assert_eq!(entry["Type"], "AWS::EKS::AccessEntry");
        let p = &entry["Properties"];
        assert_eq!(p["ClusterName"], "demo");
        assert_eq!(p["Username"], "admin");
        assert_eq!(p["KubernetesGroups"], serde_json::json!(["ops"]));
        assert!(p.get("Type").is_none());
        assert_eq!(
            p["AccessPolicies"][0]["AccessScope"],
            serde_json::json!({"Type": "namespace", "Namespaces": ["default", "kube-system"]})
        );
        assert_eq!(p["AccessPolicies"][1]["AccessScope"], serde_json::json!({"Type": "cluster"}));
        assert!(json["Outputs"].as_object().map_or(true, |o| o.is_empty()));
    }

    #[test]
    fn test_cf028_scope_validation() {
        let mut cfg = config();
        cfg.access_entries[0].access_policies[0].access_scope.namespaces.clear();
        let err = build_access_entry_stack(&cfg, &cfg.access_entries[0]).unwrap_err();
        assert!(matches!(err, Error::MissingField { .. }));

        let mut cfg = config();
        cfg.access_entries[0].access_policies[1].access_scope.scope_type = "global".into();
        let err = build_access_entry_stack(&cfg, &cfg.access_entries[0]).unwrap_err();
        assert!(err.to_string().contains("global"));

        let mut cfg = config();
        cfg.access_entries[0].access_policies[1].access_scope.namespaces = vec!["x".into()];
        assert!(build_access_entry_stack(&cfg, &cfg.access_entries[0]).is_err());
    }
}
