//! CF-021: Fixed IAM statement blocks for node add-on policies.
//!
//! Every ARN goes through `Value::partition_arn` so the same template works
//! in every partition.

use crate::core::intrinsic::Value;

const EFFECT_ALLOW: &str = "Allow";
const RESOURCE_ALL: &str = "*";

fn allow(resource: Value, actions: &[&str]) -> Value {
    Value::object([
        ("Effect", Value::from(EFFECT_ALLOW)),
        ("Resource", resource),
        ("Action", Value::strings(actions.iter().copied())),
    ])
}

fn allow_all(actions: &[&str]) -> Value {
    allow(Value::from(RESOURCE_ALL), actions)
}

fn with_condition(statement: Value, condition: Value) -> Value {
    match statement {
        Value::Object(mut fields) => {
            fields.insert("Condition".to_string(), condition);
            Value::Object(fields)
        }
        other => other,
    }
}

/// `{operator: {key: value, ...}, ...}` condition block.
fn condition(blocks: &[(&str, &[(&str, &str)])]) -> Value {
    Value::object(blocks.iter().map(|(op, entries)| {
        (
            *op,
            Value::object(entries.iter().map(|(k, v)| (*k, Value::from(*v)))),
        )
    }))
}

/// Policy document wrapping `statements`.
pub fn policy_document(statements: Vec<Value>) -> Value {
    Value::object([
        ("Version", Value::from("2012-10-17")),
        ("Statement", Value::list(statements)),
    ])
}

pub fn auto_scaler_statements() -> Vec<Value> {
    vec![allow_all(&[
        "autoscaling:DescribeAutoScalingGroups",
        "autoscaling:DescribeAutoScalingInstances",
        "autoscaling:DescribeLaunchConfigurations",
        "autoscaling:DescribeTags",
        "autoscaling:SetDesiredCapacity",
        "autoscaling:TerminateInstanceInAutoScalingGroup",
        "ec2:DescribeLaunchTemplateVersions",
    ])]
}

/// Record-set changes in any hosted zone (external-DNS, cert-manager).
pub fn change_set_statements() -> Vec<Value> {
    vec![allow(
        Value::partition_arn("route53:::hostedzone/*"),
        &["route53:ChangeResourceRecordSets"],
    )]
}

pub fn external_dns_hosted_zones_statements() -> Vec<Value> {
    vec![allow_all(&[
        "route53:ListHostedZones",
        "route53:ListResourceRecordSets",
        "route53:ListTagsForResource",
    ])]
}

pub fn cert_manager_hosted_zones_statements() -> Vec<Value> {
    vec![allow_all(&[
        "route53:ListResourceRecordSets",
        "route53:ListHostedZonesByName",
    ])]
}

pub fn cert_manager_get_change_statements() -> Vec<Value> {
    vec![allow(
        Value::partition_arn("route53:::change/*"),
        &["route53:GetChange"],
    )]
}

/// App Mesh controller; `extra_action` is `appmesh:*` or `appmesh-preview:*`.
pub fn app_mesh_statements(extra_action: &str) -> Vec<Value> {
    vec![allow_all(&[
        "servicediscovery:CreateService",
        "servicediscovery:DeleteService",
        "servicediscovery:GetService",
        "servicediscovery:GetInstance",
        "servicediscovery:RegisterInstance",
        "servicediscovery:DeregisterInstance",
        "servicediscovery:ListInstances",
        "servicediscovery:ListNamespaces",
        "servicediscovery:ListServices",
        "servicediscovery:GetInstancesHealthStatus",
        "servicediscovery:UpdateInstanceCustomHealthStatus",
        "servicediscovery:GetOperation",
        "route53:GetHealthCheck",
        "route53:CreateHealthCheck",
        "route53:UpdateHealthCheck",
        "route53:ChangeResourceRecordSets",
        "route53:DeleteHealthCheck",
        extra_action,
    ])]
}

pub fn ebs_statements() -> Vec<Value> {
    vec![allow_all(&[
        "ec2:AttachVolume",
        "ec2:CreateSnapshot",
        "ec2:CreateTags",
        "ec2:CreateVolume",
        "ec2:DeleteSnapshot",
        "ec2:DeleteTags",
        "ec2:DeleteVolume",
        "ec2:DescribeAvailabilityZones",
        "ec2:DescribeInstances",
        "ec2:DescribeSnapshots",
        "ec2:DescribeTags",
        "ec2:DescribeVolumes",
        "ec2:DescribeVolumesModifications",
        "ec2:DetachVolume",
        "ec2:ModifyVolume",
    ])]
}

pub fn fsx_statements() -> Vec<Value> {
    vec![allow_all(&["fsx:*"])]
}

pub fn service_link_role_statements() -> Vec<Value> {
    vec![allow(
        Value::partition_arn("iam::*:role/aws-service-role/*"),
        &[
            "iam:CreateServiceLinkedRole",
            "iam:AttachRolePolicy",
            "iam:PutRolePolicy",
        ],
    )]
}

pub fn efs_statements() -> Vec<Value> {
    vec![allow_all(&["elasticfilesystem:*"])]
}

pub fn efs_ec2_statements() -> Vec<Value> {
    vec![allow_all(&[
        "ec2:DescribeSubnets",
        "ec2:CreateNetworkInterface",
        "ec2:DescribeNetworkInterfaces",
        "ec2:DeleteNetworkInterface",
        "ec2:ModifyNetworkInterfaceAttribute",
        "ec2:DescribeNetworkInterfaceAttribute",
    ])]
}

pub fn xray_statements() -> Vec<Value> {
    vec![allow_all(&[
        "xray:PutTraceSegments",
        "xray:PutTelemetryRecords",
        "xray:GetSamplingRules",
        "xray:GetSamplingTargets",
        "xray:GetSamplingStatisticSummaries",
    ])]
}

pub fn load_balancer_controller_statements() -> Vec<Value> {
    let security_group = || Value::partition_arn("ec2:*:*:security-group/*");
    let cluster_request_tag = "aws:RequestTag/elbv2.k8s.aws/cluster";
    let cluster_resource_tag = "aws:ResourceTag/elbv2.k8s.aws/cluster";
    vec![
        with_condition(
            allow(security_group(), &["ec2:CreateTags"]),
            condition(&[
                ("StringEquals", &[("ec2:CreateAction", "CreateSecurityGroup")]),
                ("Null", &[(cluster_request_tag, "false")]),
            ]),
        ),
        with_condition(
            allow(security_group(), &["ec2:CreateTags", "ec2:DeleteTags"]),
            condition(&[(
                "Null",
                &[(cluster_request_tag, "true"), (cluster_resource_tag, "false")],
            )]),
        ),
        with_condition(
            allow_all(&[
                "elasticloadbalancing:CreateLoadBalancer",
                "elasticloadbalancing:CreateTargetGroup",
            ]),
            condition(&[("Null", &[(cluster_request_tag, "false")])]),
        ),
        with_condition(
            allow(
                Value::list(vec![
                    Value::partition_arn("elasticloadbalancing:*:*:targetgroup/*/*"),
                    Value::partition_arn("elasticloadbalancing:*:*:loadbalancer/net/*/*"),
                    Value::partition_arn("elasticloadbalancing:*:*:loadbalancer/app/*/*"),
                ]),
                &[
                    "elasticloadbalancing:AddTags",
                    "elasticloadbalancing:RemoveTags",
                ],
            ),
            condition(&[(
                "Null",
                &[(cluster_request_tag, "true"), (cluster_resource_tag, "false")],
            )]),
        ),
        with_condition(
            allow_all(&[
                "ec2:AuthorizeSecurityGroupIngress",
                "ec2:RevokeSecurityGroupIngress",
                "ec2:DeleteSecurityGroup",
                "elasticloadbalancing:ModifyLoadBalancerAttributes",
                "elasticloadbalancing:SetIpAddressType",
                "elasticloadbalancing:SetSecurityGroups",
                "elasticloadbalancing:SetSubnets",
                "elasticloadbalancing:DeleteLoadBalancer",
                "elasticloadbalancing:ModifyTargetGroup",
                "elasticloadbalancing:ModifyTargetGroupAttributes",
                "elasticloadbalancing:DeleteTargetGroup",
            ]),
            condition(&[("Null", &[(cluster_resource_tag, "false")])]),
        ),
        allow(
            Value::partition_arn("elasticloadbalancing:*:*:targetgroup/*/*"),
            &[
                "elasticloadbalancing:RegisterTargets",
                "elasticloadbalancing:DeregisterTargets",
            ],
        ),
        allow_all(&[
            "iam:CreateServiceLinkedRole",
            "ec2:DescribeAccountAttributes",
            "ec2:DescribeAddresses",
            "ec2:DescribeInternetGateways",
            "ec2:DescribeVpcs",
            "ec2:DescribeSubnets",
            "ec2:DescribeSecurityGroups",
            "ec2:DescribeInstances",
            "ec2:DescribeNetworkInterfaces",
            "ec2:DescribeTags",
            "elasticloadbalancing:DescribeLoadBalancers",
            "elasticloadbalancing:DescribeLoadBalancerAttributes",
            "elasticloadbalancing:DescribeListeners",
            "elasticloadbalancing:DescribeListenerCertificates",
            "elasticloadbalancing:DescribeSSLPolicies",
            "elasticloadbalancing:DescribeRules",
            "elasticloadbalancing:DescribeTargetGroups",
            "elasticloadbalancing:DescribeTargetGroupAttributes",
            "elasticloadbalancing:DescribeTargetHealth",
            "elasticloadbalancing:DescribeTags",
            "cognito-idp:DescribeUserPoolClient",
            "acm:ListCertificates",
            "acm:DescribeCertificate",
            "iam:ListServerCertificates",
            "iam:GetServerCertificate",
            "waf-regional:GetWebACL",
            "waf-regional:GetWebACLForResource",
            "waf-regional:AssociateWebACL",
            "waf-regional:DisassociateWebACL",
            "wafv2:GetWebACL",
            "wafv2:GetWebACLForResource",
            "wafv2:AssociateWebACL",
            "wafv2:DisassociateWebACL",
            "shield:GetSubscriptionState",
            "shield:DescribeProtection",
            "shield:CreateProtection",
            "shield:DeleteProtection",
            "ec2:AuthorizeSecurityGroupIngress",
            "ec2:RevokeSecurityGroupIngress",
            "ec2:CreateSecurityGroup",
            "elasticloadbalancing:CreateListener",
            "elasticloadbalancing:DeleteListener",
            "elasticloadbalancing:CreateRule",
            "elasticloadbalancing:DeleteRule",
            "elasticloadbalancing:SetWebAcl",
            "elasticloadbalancing:ModifyListener",
            "elasticloadbalancing:AddListenerCertificates",
            "elasticloadbalancing:RemoveListenerCertificates",
            "elasticloadbalancing:ModifyRule",
        ]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cf021_statement_shape() {
        let json = change_set_statements()[0].to_json();
        assert_eq!(json["Effect"], "Allow");
        assert_eq!(json["Action"][0], "route53:ChangeResourceRecordSets");
        assert_eq!(
            json["Resource"]["Fn::Sub"],
            "arn:${AWS::Partition}:route53:::hostedzone/*"
        );
    }

    #[test]
    fn test_cf021_no_hardcoded_partition() {
        let all: Vec<Value> = [
            load_balancer_controller_statements(),
            service_link_role_statements(),
            cert_manager_get_change_statements(),
        ]
        .concat();
        for s in all {
            let text = s.to_json().to_string();
            assert!(!text.contains("arn:aws:"), "hardcoded partition in {text}");
        }
    }

    #[test]
    fn test_cf021_conditions_rendered() {
        let json = load_balancer_controller_statements()[0].to_json();
        assert_eq!(
            json["Condition"]["StringEquals"]["ec2:CreateAction"],
            "CreateSecurityGroup"
        );
        assert_eq!(
            json["Condition"]["Null"]["aws:RequestTag/elbv2.k8s.aws/cluster"],
            "false"
        );
    }

    #[test]
    fn test_cf021_app_mesh_extra_action() {
        let json = app_mesh_statements("appmesh-preview:*")[0].to_json();
        let actions = json["Action"].as_array().unwrap();
        assert_eq!(actions.last().unwrap(), "appmesh-preview:*");
    }
}
