//! CF-004: Intrinsic value model.
//!
//! A closed set of deferred expressions resolved by the provisioning API at
//! deploy time. Constructors are pure and total; serialization renders the
//! nested-map wire form (`{"Ref": name}`, `{"Fn::Sub": ...}`, ...).
//! Equality and ordering are structural.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// `AWS::Partition` pseudo-parameter.
pub const PARTITION: &str = "AWS::Partition";
/// `AWS::AccountId` pseudo-parameter.
pub const ACCOUNT_ID: &str = "AWS::AccountId";
/// `AWS::Region` pseudo-parameter.
pub const REGION: &str = "AWS::Region";
/// `AWS::StackName` pseudo-parameter.
pub const STACK_NAME: &str = "AWS::StackName";
/// `AWS::URLSuffix` pseudo-parameter.
pub const URL_SUFFIX: &str = "AWS::URLSuffix";
/// `AWS::NoValue` pseudo-parameter (removes a property).
pub const NO_VALUE: &str = "AWS::NoValue";

/// An intrinsic value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// Literal string
    Str(String),
    /// Literal integer
    Int(i64),
    /// Literal boolean
    Bool(bool),
    /// `Ref` to a logical name, parameter or pseudo-parameter
    Ref(String),
    /// `Fn::GetAtt [name, attribute]`
    GetAtt { name: String, attribute: String },
    /// `Fn::Sub` over a template string, with optional local variables
    Sub {
        template: String,
        variables: BTreeMap<String, Value>,
    },
    /// `Fn::Join [delimiter, [values]]`
    Join { delimiter: String, values: Vec<Value> },
    /// `Fn::Select [index, list]`
    Select { index: u32, list: Box<Value> },
    /// `Fn::Cidr [block, count, maskBits]`
    Cidr {
        block: Box<Value>,
        count: u32,
        mask_bits: u32,
    },
    /// `Fn::FindInMap [map, top, second]`
    FindInMap {
        map: String,
        top_key: Box<Value>,
        second_key: Box<Value>,
    },
    /// `Fn::ImportValue exportName`
    ImportValue(Box<Value>),
    /// Ordered list
    List(Vec<Value>),
    /// Nested property struct (keys serialize sorted)
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn int(i: i64) -> Self {
        Value::Int(i)
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    /// `Ref` to a logical name.
    pub fn reference(name: impl Into<String>) -> Self {
        Value::Ref(name.into())
    }

    pub fn get_att(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Value::GetAtt {
            name: name.into(),
            attribute: attribute.into(),
        }
    }

    pub fn sub(template: impl Into<String>) -> Self {
        Value::Sub {
            template: template.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn sub_with(template: impl Into<String>, variables: BTreeMap<String, Value>) -> Self {
        Value::Sub {
            template: template.into(),
            variables,
        }
    }

    pub fn join(delimiter: impl Into<String>, values: Vec<Value>) -> Self {
        Value::Join {
            delimiter: delimiter.into(),
            values,
        }
    }

    pub fn select(index: u32, list: Value) -> Self {
        Value::Select {
            index,
            list: Box::new(list),
        }
    }

    pub fn cidr(block: Value, count: u32, mask_bits: u32) -> Self {
        Value::Cidr {
            block: Box::new(block),
            count,
            mask_bits,
        }
    }

    pub fn find_in_map(map: impl Into<String>, top_key: Value, second_key: Value) -> Self {
        Value::FindInMap {
            map: map.into(),
            top_key: Box::new(top_key),
            second_key: Box::new(second_key),
        }
    }

    pub fn import_value(export: Value) -> Self {
        Value::ImportValue(Box::new(export))
    }

    pub fn list(values: Vec<Value>) -> Self {
        Value::List(values)
    }

    /// List of literal strings.
    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(values.into_iter().map(|s| Value::Str(s.into())).collect())
    }

    /// Nested struct from `(key, value)` pairs.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// `Ref AWS::StackName`.
    pub fn stack_name() -> Self {
        Value::reference(STACK_NAME)
    }

    /// `Ref AWS::NoValue`.
    pub fn no_value() -> Self {
        Value::reference(NO_VALUE)
    }

    /// Partition-aware ARN: `Fn::Sub "arn:${AWS::Partition}:<rest>"`.
    pub fn partition_arn(rest: &str) -> Self {
        Value::sub(format!("arn:${{{}}}:{}", PARTITION, rest))
    }

    /// Import of `<stack>::<output>` exported by another stack.
    pub fn import_output(stack_name: &str, output: &str) -> Self {
        Value::import_value(Value::string(format!("{}::{}", stack_name, output)))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Value::Str(_) | Value::Int(_) | Value::Bool(_))
    }

    /// Logical names this value points at, pseudo-parameters excluded.
    ///
    /// `ImportValue` targets live in other stacks and are not included.
    pub fn referenced_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, names: &mut BTreeSet<String>) {
        match self {
            Value::Str(_) | Value::Int(_) | Value::Bool(_) => {}
            Value::Ref(name) => {
                if !is_pseudo(name) {
                    names.insert(name.clone());
                }
            }
            Value::GetAtt { name, .. } => {
                names.insert(name.clone());
            }
            Value::Sub {
                template,
                variables,
            } => {
                for name in sub_references(template) {
                    if !variables.contains_key(&name) {
                        names.insert(name);
                    }
                }
                for v in variables.values() {
                    v.collect_names(names);
                }
            }
            Value::Join { values, .. } | Value::List(values) => {
                for v in values {
                    v.collect_names(names);
                }
            }
            Value::Select { list, .. } => list.collect_names(names),
            Value::Cidr { block, .. } => block.collect_names(names),
            Value::FindInMap {
                top_key,
                second_key,
                ..
            } => {
                top_key.collect_names(names);
                second_key.collect_names(names);
            }
            Value::ImportValue(export) => export.collect_names(names),
            Value::Object(fields) => {
                for v in fields.values() {
                    v.collect_names(names);
                }
            }
        }
    }

    /// Literal tree from a user-supplied JSON document (inline policies).
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Value::no_value(),
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Str(n.to_string()),
            },
            J::String(s) => Value::Str(s.clone()),
            J::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            J::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render into a `serde_json::Value`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// Whether a `Ref` target is a pseudo-parameter rather than a logical name.
pub fn is_pseudo(name: &str) -> bool {
    name.starts_with("AWS::")
}

/// Names referenced by `${...}` placeholders in a `Fn::Sub` template.
///
/// `${Name.Attr}` yields `Name`; `${!Literal}` escapes and `AWS::` pseudo
/// parameters are skipped.
pub fn sub_references(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("${") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            break;
        };
        let inner = after[..close].trim();
        if !inner.is_empty() && !inner.starts_with('!') && !is_pseudo(inner) {
            let name = inner.split('.').next().unwrap_or(inner);
            names.push(name.to_string());
        }
        rest = &after[close + 1..];
    }
    names
}

struct Single<'a, T: ?Sized>(&'a str, &'a T);

impl<T: Serialize + ?Sized> Serialize for Single<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.0, self.1)?;
        map.end()
    }
}

struct Args<'a>(Vec<Arg<'a>>);

enum Arg<'a> {
    Str(&'a str),
    Int(u32),
    Value(&'a Value),
    Values(&'a [Value]),
    Vars(&'a BTreeMap<String, Value>),
}

impl Serialize for Args<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for arg in &self.0 {
            match arg {
                Arg::Str(s) => seq.serialize_element(s)?,
                Arg::Int(i) => seq.serialize_element(i)?,
                Arg::Value(v) => seq.serialize_element(v)?,
                Arg::Values(vs) => seq.serialize_element(vs)?,
                Arg::Vars(vars) => seq.serialize_element(vars)?,
            }
        }
        seq.end()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Str(s) => serializer.serialize_str(s),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Ref(name) => Single("Ref", name.as_str()).serialize(serializer),
            Value::GetAtt { name, attribute } => Single(
                "Fn::GetAtt",
                &Args(vec![Arg::Str(name), Arg::Str(attribute)]),
            )
            .serialize(serializer),
            Value::Sub {
                template,
                variables,
            } => {
                if variables.is_empty() {
                    Single("Fn::Sub", template.as_str()).serialize(serializer)
                } else {
                    Single(
                        "Fn::Sub",
                        &Args(vec![Arg::Str(template), Arg::Vars(variables)]),
                    )
                    .serialize(serializer)
                }
            }
            Value::Join { delimiter, values } => Single(
                "Fn::Join",
                &Args(vec![Arg::Str(delimiter), Arg::Values(values)]),
            )
            .serialize(serializer),
            Value::Select { index, list } => Single(
                "Fn::Select",
                &Args(vec![Arg::Int(*index), Arg::Value(list)]),
            )
            .serialize(serializer),
            Value::Cidr {
                block,
                count,
                mask_bits,
            } => Single(
                "Fn::Cidr",
                &Args(vec![Arg::Value(block), Arg::Int(*count), Arg::Int(*mask_bits)]),
            )
            .serialize(serializer),
            Value::FindInMap {
                map,
                top_key,
                second_key,
            } => Single(
                "Fn::FindInMap",
                &Args(vec![Arg::Str(map), Arg::Value(top_key), Arg::Value(second_key)]),
            )
            .serialize(serializer),
            Value::ImportValue(export) => {
                Single("Fn::ImportValue", export.as_ref()).serialize(serializer)
            }
            Value::List(values) => values.serialize(serializer),
            Value::Object(fields) => fields.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cf004_wire_forms() {
        assert_eq!(Value::reference("VPC").to_json(), json!({"Ref": "VPC"}));
        assert_eq!(
            Value::get_att("NATIP", "AllocationId").to_json(),
            json!({"Fn::GetAtt": ["NATIP", "AllocationId"]})
        );
        assert_eq!(
            Value::join(",", vec![Value::reference("A"), Value::reference("B")]).to_json(),
            json!({"Fn::Join": [",", [{"Ref": "A"}, {"Ref": "B"}]]})
        );
        assert_eq!(
            Value::select(2, Value::cidr(Value::string("10.0.0.0/16"), 8, 13)).to_json(),
            json!({"Fn::Select": [2, {"Fn::Cidr": ["10.0.0.0/16", 8, 13]}]})
        );
        let map = Value::find_in_map(
            "ServicePrincipalPartitionMap",
            Value::reference(PARTITION),
            "EC2".into(),
        );
        assert_eq!(
            map.to_json(),
            json!({
                "Fn::FindInMap": ["ServicePrincipalPartitionMap", {"Ref": "AWS::Partition"}, "EC2"]
            })
        );
        assert_eq!(
            Value::import_output("clusterforge-dev-cluster", "VPC").to_json(),
            json!({"Fn::ImportValue": "clusterforge-dev-cluster::VPC"})
        );
    }

    #[test]
    fn test_cf004_sub_with_variables() {
        let mut vars = BTreeMap::new();
        vars.insert("Suffix".to_string(), Value::string("x"));
        assert_eq!(
            Value::sub_with("${AWS::StackName}-${Suffix}", vars).to_json(),
            json!({"Fn::Sub": ["${AWS::StackName}-${Suffix}", {"Suffix": "x"}]})
        );
        assert_eq!(
            Value::partition_arn("iam::aws:policy/AmazonEKSWorkerNodePolicy").to_json(),
            json!({"Fn::Sub": "arn:${AWS::Partition}:iam::aws:policy/AmazonEKSWorkerNodePolicy"})
        );
    }

    #[test]
    fn test_cf004_structural_equality() {
        assert_eq!(Value::reference("VPC"), Value::reference("VPC"));
        assert_ne!(Value::reference("VPC"), Value::get_att("VPC", "Id"));
        let a = Value::object([("B", Value::int(1)), ("A", Value::bool(true))]);
        let b = Value::object([("A", Value::bool(true)), ("B", Value::int(1))]);
        assert_eq!(a, b);
        assert_eq!(a.to_json().to_string(), r#"{"A":true,"B":1}"#);
    }

    #[test]
    fn test_cf004_from_json_literal_tree() {
        let doc = json!({
            "Version": "2012-10-17",
            "Statement": [{"Effect": "Allow", "Action": ["s3:GetObject"], "Resource": "*"}]
        });
        let v = Value::from_json(&doc);
        assert!(v.referenced_names().is_empty());
        assert_eq!(v.to_json(), doc);
    }

    #[test]
    fn test_cf004_referenced_names() {
        let v = Value::object([
            ("VpcId", Value::reference("VPC")),
            ("Region", Value::reference(REGION)),
            ("Name", Value::sub("${AWS::StackName}/${NATGateway}-${SG.GroupId}-${!Literal}")),
            ("Import", Value::import_output("other", "SharedNodeSecurityGroup")),
        ]);
        let names: Vec<String> = v.referenced_names().into_iter().collect();
        assert_eq!(names, vec!["NATGateway", "SG", "VPC"]);
    }
}
