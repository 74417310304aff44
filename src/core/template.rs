//! CF-005: Resource Set and template wire format.
//!
//! Builders add resources and outputs to a `ResourceSet`; `finish()` checks
//! references, renders the JSON document once and hands back an immutable
//! `RenderedStack` carrying the collector side table.

use super::intrinsic::Value;
use super::outputs::{split_joined, Collector, OutputBinding, OutputCollectors};
use super::resolver;
use super::types::ClusterConfig;
use crate::error::{Error, Result};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Template format version every rendered document carries.
pub const FORMAT_VERSION: &str = "2010-09-09";

pub const CAPABILITY_IAM: &str = "CAPABILITY_IAM";
pub const CAPABILITY_NAMED_IAM: &str = "CAPABILITY_NAMED_IAM";

/// How a resource kind carries tags, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStyle {
    /// `Tags: [{Key, Value}]`
    List,
    /// `Tags: {key: value}`
    Map,
}

/// Closed set of resource kinds the builders emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Vpc,
    VpcCidrBlock,
    VpcGatewayAttachment,
    VpcEndpoint,
    Subnet,
    SubnetCidrBlock,
    SubnetRouteTableAssociation,
    InternetGateway,
    EgressOnlyInternetGateway,
    RouteTable,
    Route,
    Eip,
    NatGateway,
    SecurityGroup,
    SecurityGroupIngress,
    SecurityGroupEgress,
    LaunchTemplate,
    PlacementGroup,
    AutoScalingGroup,
    IamRole,
    IamPolicy,
    IamInstanceProfile,
    EksCluster,
    EksNodegroup,
    EksAccessEntry,
}

impl ResourceKind {
    /// Wire `Type` of the kind.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Vpc => "AWS::EC2::VPC",
            Self::VpcCidrBlock => "AWS::EC2::VPCCidrBlock",
            Self::VpcGatewayAttachment => "AWS::EC2::VPCGatewayAttachment",
            Self::VpcEndpoint => "AWS::EC2::VPCEndpoint",
            Self::Subnet => "AWS::EC2::Subnet",
            Self::SubnetCidrBlock => "AWS::EC2::SubnetCidrBlock",
            Self::SubnetRouteTableAssociation => "AWS::EC2::SubnetRouteTableAssociation",
            Self::InternetGateway => "AWS::EC2::InternetGateway",
            Self::EgressOnlyInternetGateway => "AWS::EC2::EgressOnlyInternetGateway",
            Self::RouteTable => "AWS::EC2::RouteTable",
            Self::Route => "AWS::EC2::Route",
            Self::Eip => "AWS::EC2::EIP",
            Self::NatGateway => "AWS::EC2::NatGateway",
            Self::SecurityGroup => "AWS::EC2::SecurityGroup",
            Self::SecurityGroupIngress => "AWS::EC2::SecurityGroupIngress",
            Self::SecurityGroupEgress => "AWS::EC2::SecurityGroupEgress",
            Self::LaunchTemplate => "AWS::EC2::LaunchTemplate",
            Self::PlacementGroup => "AWS::EC2::PlacementGroup",
            Self::AutoScalingGroup => "AWS::AutoScaling::AutoScalingGroup",
            Self::IamRole => "AWS::IAM::Role",
            Self::IamPolicy => "AWS::IAM::Policy",
            Self::IamInstanceProfile => "AWS::IAM::InstanceProfile",
            Self::EksCluster => "AWS::EKS::Cluster",
            Self::EksNodegroup => "AWS::EKS::Nodegroup",
            Self::EksAccessEntry => "AWS::EKS::AccessEntry",
        }
    }

    /// How the kind carries tags; `None` for untaggable kinds.
    pub fn tag_style(self) -> Option<TagStyle> {
        match self {
            Self::Vpc
            | Self::Subnet
            | Self::InternetGateway
            | Self::RouteTable
            | Self::Eip
            | Self::NatGateway
            | Self::SecurityGroup
            | Self::IamRole
            | Self::EksCluster => Some(TagStyle::List),
            Self::EksNodegroup => Some(TagStyle::Map),
            _ => None,
        }
    }

    /// Whether the kind needs an IAM capability to be created.
    fn iam_capability(self) -> bool {
        matches!(
            self,
            Self::IamRole | Self::IamPolicy | Self::IamInstanceProfile
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// One resource body.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub properties: BTreeMap<String, Value>,
    pub depends_on: Vec<String>,
    pub deletion_policy: Option<String>,
    pub update_replace_policy: Option<String>,
    /// `UpdatePolicy` block, used by auto scaling groups
    pub update_policy: Option<Value>,
    pub condition: Option<String>,
}

impl Resource {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
            update_policy: None,
            condition: None,
        }
    }

    /// Set a property.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Set a property only when a value is present.
    pub fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
        self
    }

    pub fn deletion_policy(mut self, policy: impl Into<String>) -> Self {
        self.deletion_policy = Some(policy.into());
        self
    }

    pub fn update_policy(mut self, policy: Value) -> Self {
        self.update_policy = Some(policy);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Tag access for kinds that support tags.
    pub fn taggable(&mut self) -> Option<TaggedResource<'_>> {
        let style = self.kind.tag_style()?;
        Some(TaggedResource {
            style,
            resource: self,
        })
    }
}

/// Tag operations on a taggable resource.
pub trait Taggable {
    fn has_tag(&self, key: &str) -> bool;
    fn set_tag(&mut self, key: &str, value: Value);
}

/// A resource whose kind supports tags.
pub struct TaggedResource<'a> {
    style: TagStyle,
    resource: &'a mut Resource,
}

fn tag_entry_key(entry: &Value) -> Option<&str> {
    match entry {
        Value::Object(fields) => fields.get("Key").and_then(Value::as_str),
        _ => None,
    }
}

impl Taggable for TaggedResource<'_> {
    fn has_tag(&self, key: &str) -> bool {
        match (self.style, self.resource.properties.get("Tags")) {
            (TagStyle::List, Some(Value::List(entries))) => {
                entries.iter().any(|e| tag_entry_key(e) == Some(key))
            }
            (TagStyle::Map, Some(Value::Object(map))) => map.contains_key(key),
            _ => false,
        }
    }

    fn set_tag(&mut self, key: &str, value: Value) {
        let style = self.style;
        let tags = self
            .resource
            .properties
            .entry("Tags".to_string())
            .or_insert_with(|| match style {
                TagStyle::List => Value::List(Vec::new()),
                TagStyle::Map => Value::Object(BTreeMap::new()),
            });
        match tags {
            Value::List(entries) => {
                entries.retain(|e| tag_entry_key(e) != Some(key));
                entries.push(Value::object([("Key", Value::from(key)), ("Value", value)]));
            }
            Value::Object(map) => {
                map.insert(key.to_string(), value);
            }
            _ => {}
        }
    }
}

impl Serialize for Resource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("Type", self.kind.type_name())?;
        if let Some(ref c) = self.condition {
            map.serialize_entry("Condition", c)?;
        }
        if !self.depends_on.is_empty() {
            map.serialize_entry("DependsOn", &self.depends_on)?;
        }
        if let Some(ref p) = self.deletion_policy {
            map.serialize_entry("DeletionPolicy", p)?;
        }
        if let Some(ref p) = self.update_replace_policy {
            map.serialize_entry("UpdateReplacePolicy", p)?;
        }
        if let Some(ref p) = self.update_policy {
            map.serialize_entry("UpdatePolicy", p)?;
        }
        if !self.properties.is_empty() {
            map.serialize_entry("Properties", &self.properties)?;
        }
        map.end()
    }
}

/// Template parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub param_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Export block of an output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Export {
    pub name: Value,
}

/// Template output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

/// The serialized document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    pub description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub mappings: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
    pub resources: BTreeMap<String, Resource>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

/// Builder-facing set of resources for one stack.
///
/// Owned by a single build pass. Collector callbacks are kept beside the
/// template and never serialized.
#[derive(Debug)]
pub struct ResourceSet {
    template: Template,
    collectors: OutputCollectors,
    with_iam: bool,
    with_named_iam: bool,
}

impl ResourceSet {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            template: Template {
                format_version: FORMAT_VERSION.to_string(),
                description: description.into(),
                ..Template::default()
            },
            collectors: OutputCollectors::new(),
            with_iam: false,
            with_named_iam: false,
        }
    }

    /// Add a resource under a unique logical name and return a `Ref` to it.
    ///
    /// Taggable kinds without an explicit `Name` tag get
    /// `${AWS::StackName}/<name>`.
    pub fn add_resource(&mut self, name: &str, mut resource: Resource) -> Result<Value> {
        if self.template.resources.contains_key(name) {
            return Err(Error::DuplicateResource {
                name: name.to_string(),
            });
        }
        if let Some(mut tagged) = resource.taggable() {
            if !tagged.has_tag("Name") {
                tagged.set_tag("Name", Value::sub(format!("${{AWS::StackName}}/{}", name)));
            }
        }
        if resource.kind.iam_capability() {
            self.with_iam = true;
            if resource.kind == ResourceKind::IamRole && resource.property("RoleName").is_some() {
                self.with_named_iam = true;
            }
        }
        self.template.resources.insert(name.to_string(), resource);
        Ok(Value::reference(name))
    }

    pub fn add_parameter(&mut self, name: &str, parameter: Parameter) -> Value {
        self.template.parameters.insert(name.to_string(), parameter);
        Value::reference(name)
    }

    /// Add a two-level mapping usable through `Fn::FindInMap`.
    pub fn add_mapping(
        &mut self,
        name: &str,
        entries: BTreeMap<String, BTreeMap<String, Value>>,
    ) {
        self.template.mappings.insert(name.to_string(), entries);
    }

    /// Register an output and its optional collector.
    ///
    /// Exported outputs use `${AWS::StackName}::<name>` as export name.
    pub fn add_output(
        &mut self,
        name: &str,
        value: Value,
        exported: bool,
        collector: Option<(bool, Collector)>,
    ) -> Result<()> {
        if self.template.outputs.contains_key(name) {
            return Err(Error::DuplicateOutput {
                name: name.to_string(),
            });
        }
        if let Some((required, collector)) = collector {
            self.collectors
                .insert(OutputBinding::new(name, required, collector))?;
        }
        let export = exported.then(|| Export {
            name: Value::sub(format!("${{AWS::StackName}}::{}", name)),
        });
        self.template
            .outputs
            .insert(name.to_string(), Output { value, export });
        Ok(())
    }

    /// Output with a required collector.
    pub fn define_output<F>(
        &mut self,
        name: &str,
        value: Value,
        exported: bool,
        collector: F,
    ) -> Result<()>
    where
        F: FnOnce(&str, &mut ClusterConfig) -> Result<()> + Send + Sync + 'static,
    {
        self.add_output(name, value, exported, Some((true, Box::new(collector))))
    }

    /// Output whose collector is skipped when the live stack lacks it.
    pub fn define_optional_output<F>(
        &mut self,
        name: &str,
        value: Value,
        exported: bool,
        collector: F,
    ) -> Result<()>
    where
        F: FnOnce(&str, &mut ClusterConfig) -> Result<()> + Send + Sync + 'static,
    {
        self.add_output(name, value, exported, Some((false, Box::new(collector))))
    }

    pub fn define_output_without_collector(
        &mut self,
        name: &str,
        value: Value,
        exported: bool,
    ) -> Result<()> {
        self.add_output(name, value, exported, None)
    }

    /// Output of `Fn::GetAtt logical.attribute`.
    pub fn define_output_from_att<F>(
        &mut self,
        name: &str,
        logical: &str,
        attribute: &str,
        exported: bool,
        collector: F,
    ) -> Result<()>
    where
        F: FnOnce(&str, &mut ClusterConfig) -> Result<()> + Send + Sync + 'static,
    {
        self.define_output(name, Value::get_att(logical, attribute), exported, collector)
    }

    /// Comma-joined list output; the collector receives the split parts.
    pub fn define_joined_output<F>(
        &mut self,
        name: &str,
        values: Vec<Value>,
        exported: bool,
        collector: F,
    ) -> Result<()>
    where
        F: FnOnce(Vec<String>, &mut ClusterConfig) -> Result<()> + Send + Sync + 'static,
    {
        self.define_output(
            name,
            Value::join(",", values),
            exported,
            move |v, cfg| collector(split_joined(v), cfg),
        )
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.template.description = description.into();
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.template.outputs.contains_key(name)
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Validate references and render the document once.
    pub fn finish(self) -> Result<RenderedStack> {
        resolver::validate_references(&self.template)?;
        let template = serde_json::to_vec_pretty(&self.template)?;
        let hash = format!("blake3:{}", blake3::hash(&template).to_hex());
        let mut capabilities = Vec::new();
        if self.with_iam {
            capabilities.push(CAPABILITY_IAM.to_string());
        }
        if self.with_named_iam {
            capabilities.push(CAPABILITY_NAMED_IAM.to_string());
        }
        Ok(RenderedStack {
            template,
            hash,
            outputs: self.collectors,
            capabilities,
        })
    }
}

/// A finished template plus its collector side table.
#[derive(Debug)]
pub struct RenderedStack {
    pub template: Vec<u8>,
    /// `blake3:<hex>` over the template bytes
    pub hash: String,
    pub outputs: OutputCollectors,
    pub capabilities: Vec<String>,
}

impl RenderedStack {
    pub fn template_str(&self) -> &str {
        std::str::from_utf8(&self.template).unwrap_or_default()
    }

    /// Parsed document, for assertions and rendering.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.template)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vpc() -> Resource {
        Resource::new(ResourceKind::Vpc).with("CidrBlock", "192.168.0.0/16")
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_cf005_rendered_stack_crosses_tasks() {
        assert_send_sync::<RenderedStack>();
        assert_send_sync::<ResourceSet>();
    }

    #[test]
    fn test_cf005_add_resource_returns_ref() {
        let mut set = ResourceSet::new("test");
        let r = set.add_resource("VPC", vpc()).unwrap();
        assert_eq!(r, Value::reference("VPC"));
    }

    #[test]
    fn test_cf005_duplicate_name_fails() {
        let mut set = ResourceSet::new("test");
        set.add_resource("VPC", vpc()).unwrap();
        let err = set.add_resource("VPC", vpc()).unwrap_err();
        assert!(matches!(err, Error::DuplicateResource { ref name } if name == "VPC"));
    }

    #[test]
    fn test_cf005_auto_name_tag() {
        let mut set = ResourceSet::new("test");
        set.add_resource("VPC", vpc()).unwrap();
        let json = set.finish().unwrap().to_json().unwrap();
        let tags = &json["Resources"]["VPC"]["Properties"]["Tags"];
        assert_eq!(tags[0]["Key"], "Name");
        assert_eq!(tags[0]["Value"]["Fn::Sub"], "${AWS::StackName}/VPC");
    }

    #[test]
    fn test_cf005_explicit_name_tag_kept() {
        let mut set = ResourceSet::new("test");
        let mut r = vpc();
        if let Some(mut tagged) = r.taggable() {
            tagged.set_tag("Name", Value::from("mine"));
        }
        set.add_resource("VPC", r).unwrap();
        let json = set.finish().unwrap().to_json().unwrap();
        let tags = json["Resources"]["VPC"]["Properties"]["Tags"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0]["Value"], "mine");
    }

    #[test]
    fn test_cf005_untaggable_kind_untouched() {
        let mut set = ResourceSet::new("test");
        set.add_resource("VPC", vpc()).unwrap();
        set.add_resource(
            "Route",
            Resource::new(ResourceKind::Route).with("RouteTableId", Value::reference("VPC")),
        )
        .unwrap();
        let json = set.finish().unwrap().to_json().unwrap();
        assert!(json["Resources"]["Route"]["Properties"].get("Tags").is_none());
    }

    #[test]
    fn test_cf005_map_style_tags() {
        let mut r = Resource::new(ResourceKind::EksNodegroup);
        let mut tagged = r.taggable().unwrap();
        assert!(!tagged.has_tag("Name"));
        tagged.set_tag("team", Value::from("infra"));
        assert!(tagged.has_tag("team"));
        assert!(matches!(r.property("Tags"), Some(Value::Object(_))));
    }

    #[test]
    fn test_cf005_exported_output_wire_form() {
        let mut set = ResourceSet::new("test");
        set.add_resource("VPC", vpc()).unwrap();
        set.define_output("VPC", Value::reference("VPC"), true, |_, _| Ok(()))
            .unwrap();
        set.define_output_without_collector("Feature", Value::from("x"), false)
            .unwrap();
        let stack = set.finish().unwrap();
        assert_eq!(stack.outputs.len(), 1);
        let json = stack.to_json().unwrap();
        assert_eq!(json["Outputs"]["VPC"]["Value"]["Ref"], "VPC");
        assert_eq!(
            json["Outputs"]["VPC"]["Export"]["Name"]["Fn::Sub"],
            "${AWS::StackName}::VPC"
        );
        assert!(json["Outputs"]["Feature"].get("Export").is_none());
    }

    #[test]
    fn test_cf005_duplicate_output_fails() {
        let mut set = ResourceSet::new("test");
        set.define_output_without_collector("A", Value::from("x"), false)
            .unwrap();
        assert!(set
            .define_output_without_collector("A", Value::from("y"), false)
            .is_err());
    }

    #[test]
    fn test_cf005_empty_sections_omitted() {
        let set = ResourceSet::new("empty");
        let json = set.finish().unwrap().to_json().unwrap();
        assert_eq!(json["AWSTemplateFormatVersion"], FORMAT_VERSION);
        assert_eq!(json["Description"], "empty");
        assert!(json.get("Outputs").is_none());
        assert!(json.get("Parameters").is_none());
        assert!(json.get("Mappings").is_none());
        assert!(json.get("Resources").is_some());
    }

    #[test]
    fn test_cf005_unknown_reference_rejected() {
        let mut set = ResourceSet::new("test");
        set.add_resource(
            "Subnet",
            Resource::new(ResourceKind::Subnet).with("VpcId", Value::reference("VPC")),
        )
        .unwrap();
        let err = set.finish().unwrap_err();
        assert!(matches!(err, Error::UnknownReference { .. }));
    }

    #[test]
    fn test_cf005_iam_capabilities() {
        let mut set = ResourceSet::new("test");
        set.add_resource(
            "Role",
            Resource::new(ResourceKind::IamRole).with("RoleName", "named"),
        )
        .unwrap();
        let stack = set.finish().unwrap();
        assert_eq!(stack.capabilities, vec![CAPABILITY_IAM, CAPABILITY_NAMED_IAM]);
    }

    fn build(names: &[String]) -> RenderedStack {
        let mut set = ResourceSet::new("det");
        for n in names {
            set.add_resource(
                n,
                Resource::new(ResourceKind::SecurityGroup).with("GroupDescription", n.as_str()),
            )
                .unwrap();
        }
        set.finish().unwrap()
    }

    proptest! {
        #[test]
        fn test_cf005_render_deterministic(
            names in proptest::collection::btree_set("[A-Z][a-zA-Z0-9]{0,8}", 1..8),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let a = build(&names);
            let b = build(&names);
            prop_assert_eq!(&a.template, &b.template);
            prop_assert_eq!(a.hash, b.hash);
        }

        #[test]
        fn test_cf005_duplicate_always_fails(name in "[A-Z][a-zA-Z0-9]{0,12}") {
            let mut set = ResourceSet::new("dup");
            set.add_resource(&name, vpc()).unwrap();
            prop_assert!(set.add_resource(&name, Resource::new(ResourceKind::Eip)).is_err());
        }
    }
}
