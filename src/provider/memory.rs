//! In-memory provider: a deterministic simulation of the provisioning API.
//!
//! Stacks settle after a configurable number of describe calls, outputs are
//! synthesized from the submitted template, and failures can be injected
//! per operation or per stack.

use super::*;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

const ACCOUNT: &str = "000000000000";

struct MemStack {
    stack: Stack,
    template: Vec<u8>,
    /// Status to move to and the describe calls left before it happens
    pending: Option<(StackStatus, u32)>,
    events: Vec<StackEvent>,
}

#[derive(Default)]
struct MemoryState {
    stacks: BTreeMap<String, MemStack>,
    next_id: u64,
    zones: BTreeMap<String, ZoneType>,
    offerings: Option<BTreeMap<String, BTreeSet<String>>>,
    instance_info: BTreeMap<String, InstanceTypeInfo>,
    subnets: BTreeMap<String, Subnet>,
    route_tables: BTreeMap<String, String>,
    launch_templates: BTreeMap<String, LaunchTemplateData>,
    failures: VecDeque<(String, ApiError)>,
    failing_stacks: BTreeMap<String, String>,
    output_overrides: BTreeMap<String, String>,
    calls: BTreeMap<String, u32>,
}

/// Simulated `StackApi` + `Ec2Api`.
pub struct MemoryProvider {
    region: String,
    settle_after: u32,
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    /// Provider with three availability zones `<region>a..c`, every instance
    /// type offered everywhere and stacks settling after one poll.
    pub fn new(region: &str) -> Self {
        let mut state = MemoryState::default();
        for suffix in ["a", "b", "c"] {
            state
                .zones
                .insert(format!("{}{}", region, suffix), ZoneType::AvailabilityZone);
        }
        for info in builtin_instance_types() {
            state.instance_info.insert(info.instance_type.clone(), info);
        }
        Self {
            region: region.to_string(),
            settle_after: 1,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Describe calls an in-progress stack needs before it settles.
    pub fn settle_after(mut self, polls: u32) -> Self {
        self.settle_after = polls;
        self
    }

    pub fn with_zone(self, name: &str, zone_type: ZoneType) -> Self {
        self.state().zones.insert(name.to_string(), zone_type);
        self
    }

    /// Restrict offerings: `zone` offers exactly `types`. Zones never
    /// configured this way offer nothing once any zone is restricted.
    pub fn with_offerings(self, zone: &str, types: &[&str]) -> Self {
        self.state()
            .offerings
            .get_or_insert_with(BTreeMap::new)
            .insert(zone.to_string(), types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_instance_type(self, info: InstanceTypeInfo) -> Self {
        self.state()
            .instance_info
            .insert(info.instance_type.clone(), info);
        self
    }

    pub fn with_subnet(self, subnet: Subnet) -> Self {
        self.state().subnets.insert(subnet.id.clone(), subnet);
        self
    }

    pub fn with_route_table(self, subnet_id: &str, route_table_id: &str) -> Self {
        self.state()
            .route_tables
            .insert(subnet_id.to_string(), route_table_id.to_string());
        self
    }

    pub fn with_launch_template(self, id: &str, data: LaunchTemplateData) -> Self {
        self.state().launch_templates.insert(id.to_string(), data);
        self
    }

    /// Value to report for every output with this name.
    pub fn with_output(self, name: &str, value: &str) -> Self {
        self.state()
            .output_overrides
            .insert(name.to_string(), value.to_string());
        self
    }

    /// The next call of `operation` fails with `err`.
    pub fn fail_next(&self, operation: &str, err: ApiError) {
        self.state().failures.push_back((operation.to_string(), err));
    }

    /// Creating `stack` ends in ROLLBACK_COMPLETE with `reason`.
    pub fn fail_stack(&self, stack: &str, reason: &str) {
        self.state()
            .failing_stacks
            .insert(stack.to_string(), reason.to_string());
    }

    /// Seed an existing stack, e.g. one created by another tool.
    pub fn insert_stack(&self, stack: Stack) {
        self.state().stacks.insert(
            stack.name.clone(),
            MemStack {
                stack,
                template: Vec::new(),
                pending: None,
                events: Vec::new(),
            },
        );
    }

    /// Template last submitted for a stack.
    pub fn stack_template(&self, name: &str) -> Option<Vec<u8>> {
        self.state().stacks.get(name).map(|s| s.template.clone())
    }

    /// How many times an operation was called.
    pub fn calls(&self, operation: &str) -> u32 {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.state().stacks.keys().cloned().collect()
    }

    fn enter(&self, operation: &str) -> ApiResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.state();
        *state.calls.entry(operation.to_string()).or_default() += 1;
        if let Some(pos) = state.failures.iter().position(|(op, _)| op == operation) {
            if let Some((_, err)) = state.failures.remove(pos) {
                return Err(err);
            }
        }
        Ok(state)
    }

    fn synthesize_outputs(
        &self,
        stack: &str,
        template: &[u8],
        overrides: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let doc: serde_json::Value = match serde_json::from_slice(template) {
            Ok(doc) => doc,
            Err(_) => return BTreeMap::new(),
        };
        let eval = Evaluator {
            stack,
            region: &self.region,
            resources: &doc["Resources"],
        };
        let mut outputs = BTreeMap::new();
        if let Some(declared) = doc["Outputs"].as_object() {
            for (name, output) in declared {
                let value = match overrides.get(name) {
                    Some(v) => v.clone(),
                    None => eval.eval(&output["Value"]),
                };
                outputs.insert(name.clone(), value);
            }
        }
        outputs
    }
}

fn builtin_instance_types() -> Vec<InstanceTypeInfo> {
    [
        ("p4d.24xlarge", 4, true),
        ("p5.48xlarge", 32, true),
        ("c5n.18xlarge", 1, true),
        ("g4dn.12xlarge", 1, true),
        ("m5.large", 1, false),
        ("m6i.large", 1, false),
        ("t3.medium", 1, false),
    ]
    .into_iter()
    .map(|(t, cards, efa)| InstanceTypeInfo {
        instance_type: t.to_string(),
        max_network_cards: cards,
        efa_supported: efa,
    })
    .collect()
}

fn short_hash(parts: &[&str]) -> String {
    let hex = blake3::hash(parts.join("/").as_bytes()).to_hex();
    hex[..17].to_string()
}

/// Evaluates the intrinsic wire form well enough to fake stack outputs.
struct Evaluator<'a> {
    stack: &'a str,
    region: &'a str,
    resources: &'a serde_json::Value,
}

impl Evaluator<'_> {
    fn eval(&self, v: &serde_json::Value) -> String {
        use serde_json::Value as J;
        match v {
            J::String(s) => s.clone(),
            J::Number(n) => n.to_string(),
            J::Bool(b) => b.to_string(),
            J::Object(map) => {
                if let Some(J::String(name)) = map.get("Ref") {
                    return self.reference(name);
                }
                if let Some(J::Array(args)) = map.get("Fn::GetAtt") {
                    let name = args.first().and_then(J::as_str).unwrap_or_default();
                    let att = args.get(1).and_then(J::as_str).unwrap_or_default();
                    return self.attribute(name, att);
                }
                if let Some(J::Array(args)) = map.get("Fn::Join") {
                    let delim = args.first().and_then(J::as_str).unwrap_or_default();
                    let items = match args.get(1) {
                        Some(J::Array(items)) => items.iter().map(|i| self.eval(i)).collect(),
                        _ => Vec::new(),
                    };
                    return items.join(delim);
                }
                if let Some(sub) = map.get("Fn::Sub") {
                    let template = match sub {
                        J::String(s) => s.as_str(),
                        J::Array(a) => a.first().and_then(J::as_str).unwrap_or_default(),
                        _ => "",
                    };
                    return self.substitute(template);
                }
                if let Some(J::Array(args)) = map.get("Fn::Select") {
                    let index = args.first().and_then(J::as_u64).unwrap_or(0) as usize;
                    if let Some(J::Array(items)) = args.get(1) {
                        return items.get(index).map(|i| self.eval(i)).unwrap_or_default();
                    }
                    return String::new();
                }
                if let Some(import) = map.get("Fn::ImportValue") {
                    return format!("imported-{}", self.eval(import));
                }
                String::new()
            }
            _ => String::new(),
        }
    }

    fn resource_type(&self, name: &str) -> &str {
        self.resources[name]["Type"].as_str().unwrap_or_default()
    }

    fn reference(&self, name: &str) -> String {
        match name {
            "AWS::StackName" => return self.stack.to_string(),
            "AWS::Region" => return self.region.to_string(),
            "AWS::Partition" => return "aws".to_string(),
            "AWS::AccountId" => return ACCOUNT.to_string(),
            "AWS::URLSuffix" => return "amazonaws.com".to_string(),
            _ => {}
        }
        let id = short_hash(&[self.stack, name]);
        match self.resource_type(name) {
            "AWS::EC2::VPC" => format!("vpc-{}", id),
            "AWS::EC2::Subnet" => format!("subnet-{}", id),
            "AWS::EC2::SecurityGroup" => format!("sg-{}", id),
            "AWS::EC2::RouteTable" => format!("rtb-{}", id),
            "AWS::EC2::InternetGateway" => format!("igw-{}", id),
            "AWS::EC2::NatGateway" => format!("nat-{}", id),
            "AWS::EC2::LaunchTemplate" => format!("lt-{}", id),
            "AWS::EKS::Cluster" | "AWS::EKS::Nodegroup" => format!("{}-{}", self.stack, name),
            "AWS::IAM::Role" => format!("{}-{}-{}", self.stack, name, &id[..6]),
            _ => format!("{}-{}", name.to_lowercase(), id),
        }
    }

    fn attribute(&self, name: &str, attribute: &str) -> String {
        let id = short_hash(&[self.stack, name, attribute]);
        match (self.resource_type(name), attribute) {
            ("AWS::IAM::Role", "Arn") => {
                format!("arn:aws:iam::{}:role/{}", ACCOUNT, self.reference(name))
            }
            ("AWS::IAM::InstanceProfile", "Arn") => format!(
                "arn:aws:iam::{}:instance-profile/{}-{}",
                ACCOUNT, self.stack, name
            ),
            ("AWS::EKS::Cluster", "Arn") => format!(
                "arn:aws:eks:{}:{}:cluster/{}",
                self.region,
                ACCOUNT,
                self.reference(name)
            ),
            ("AWS::EKS::Cluster", "Endpoint") => {
                format!("https://{}.gr7.{}.eks.amazonaws.com", id, self.region)
            }
            ("AWS::EKS::Cluster", "CertificateAuthorityData") => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(format!(
                    "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
                    id
                ))
            }
            ("AWS::EKS::Cluster", "ClusterSecurityGroupId") | (_, "GroupId") => format!(
                "sg-{}",
                id
            ),
            (_, "Arn") => format!(
                "arn:aws:{}:{}:{}:{}",
                "cloudformation",
                self.region,
                ACCOUNT,
                id
            ),
            _ => format!("{}-{}", attribute.to_lowercase(), id),
        }
    }

    fn substitute(&self, template: &str) -> String {
        let mut out = String::new();
        let mut rest = template;
        while let Some(open) = rest.find("${") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find('}') {
                Some(close) => {
                    let key = &after[..close];
                    if let Some(literal) = key.strip_prefix('!') {
                        out.push_str("${");
                        out.push_str(literal);
                        out.push('}');
                    } else if let Some((name, att)) = key.split_once('.') {
                        out.push_str(&self.attribute(name, att));
                    } else {
                        out.push_str(&self.reference(key));
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn resource_events(template: &[u8], status: &str) -> Vec<StackEvent> {
    let doc: serde_json::Value = serde_json::from_slice(template).unwrap_or_default();
    doc["Resources"]
        .as_object()
        .map(|resources| {
            resources
                .iter()
                .map(|(name, body)| StackEvent {
                    logical_id: name.clone(),
                    resource_type: body["Type"].as_str().unwrap_or_default().to_string(),
                    status: status.to_string(),
                    reason: None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl StackApi for MemoryProvider {
    async fn create_stack(&self, request: &StackRequest) -> ApiResult<String> {
        let mut state = self.enter("create_stack")?;
        if state.stacks.contains_key(&request.name) {
            return Err(ApiError::already_exists(format!(
                "Stack [{}] already exists",
                request.name
            )));
        }
        state.next_id += 1;
        let id = format!(
            "arn:aws:cloudformation:{}:{}:stack/{}/{}",
            self.region, ACCOUNT, request.name, state.next_id
        );
        let failing = state.failing_stacks.get(&request.name).cloned();
        let (target, reason, mut events) = match failing {
            Some(reason) => {
                let event = StackEvent {
                    logical_id: request.name.clone(),
                    resource_type: "AWS::CloudFormation::Stack".to_string(),
                    status: "CREATE_FAILED".to_string(),
                    reason: Some(reason.clone()),
                };
                (StackStatus::RollbackComplete, Some(reason), vec![event])
            }
            None => (StackStatus::CreateComplete, None, Vec::new()),
        };
        if reason.is_none() {
            events = resource_events(&request.template, "CREATE_COMPLETE");
        }
        state.stacks.insert(
            request.name.clone(),
            MemStack {
                stack: Stack {
                    name: request.name.clone(),
                    id: id.clone(),
                    status: StackStatus::CreateInProgress,
                    status_reason: reason,
                    outputs: BTreeMap::new(),
                    tags: request.tags.clone(),
                },
                template: request.template.clone(),
                pending: Some((target, self.settle_after)),
                events,
            },
        );
        Ok(id)
    }

    async fn update_stack(&self, request: &StackRequest) -> ApiResult<()> {
        let mut state = self.enter("update_stack")?;
        let settle_after = self.settle_after;
        let entry = state.stacks.get_mut(&request.name).ok_or_else(|| {
            ApiError::validation(format!("Stack with id {} does not exist", request.name))
        })?;
        if entry.template == request.template && entry.stack.tags == request.tags {
            return Err(ApiError::validation("No updates are to be performed."));
        }
        entry.template = request.template.clone();
        entry.stack.tags = request.tags.clone();
        entry.stack.status = StackStatus::UpdateInProgress;
        entry.pending = Some((StackStatus::UpdateComplete, settle_after));
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_stack")?;
        let settle_after = self.settle_after;
        if let Some(entry) = state.stacks.get_mut(name) {
            entry.stack.status = StackStatus::DeleteInProgress;
            entry.pending = Some((StackStatus::DeleteComplete, settle_after));
        }
        Ok(())
    }

    async fn describe_stack(&self, name: &str) -> ApiResult<Option<Stack>> {
        let mut state = self.enter("describe_stack")?;
        let overrides = state.output_overrides.clone();
        let Some(entry) = state.stacks.get_mut(name) else {
            return Ok(None);
        };
        match entry.pending {
            Some((target, 0)) => {
                entry.pending = None;
                if target == StackStatus::DeleteComplete {
                    state.stacks.remove(name);
                    return Ok(None);
                }
                entry.stack.status = target;
                if matches!(target, StackStatus::CreateComplete | StackStatus::UpdateComplete) {
                    let template = entry.template.clone();
                    entry.stack.outputs = self.synthesize_outputs(name, &template, &overrides);
                }
            }
            Some((target, left)) => entry.pending = Some((target, left - 1)),
            None => {}
        }
        Ok(Some(entry.stack.clone()))
    }

    async fn list_stacks(&self, prefix: &str) -> ApiResult<Vec<Stack>> {
        let state = self.enter("list_stacks")?;
        Ok(state
            .stacks
            .values()
            .filter(|s| s.stack.name.starts_with(prefix))
            .map(|s| s.stack.clone())
            .collect())
    }

    async fn describe_stack_events(&self, name: &str) -> ApiResult<Vec<StackEvent>> {
        let state = self.enter("describe_stack_events")?;
        Ok(state
            .stacks
            .get(name)
            .map(|s| s.events.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Ec2Api for MemoryProvider {
    async fn describe_subnets(&self, ids: &[String]) -> ApiResult<Vec<Subnet>> {
        let state = self.enter("describe_subnets")?;
        ids.iter()
            .map(|id| {
                state.subnets.get(id).cloned().ok_or_else(|| {
                    ApiError::new(
                        "InvalidSubnetID.NotFound",
                        format!("The subnet ID '{}' does not exist", id),
                        false,
                    )
                })
            })
            .collect()
    }

    async fn zone_types(&self, _region: &str) -> ApiResult<BTreeMap<String, ZoneType>> {
        let state = self.enter("zone_types")?;
        Ok(state.zones.clone())
    }

    async fn instance_type_offerings(
        &self,
        instance_types: &[String],
        zones: &[String],
    ) -> ApiResult<BTreeMap<String, BTreeSet<String>>> {
        let state = self.enter("instance_type_offerings")?;
        let wanted: BTreeSet<String> = instance_types.iter().cloned().collect();
        Ok(zones
            .iter()
            .map(|zone| {
                let offered = match &state.offerings {
                    None => wanted.clone(),
                    Some(map) => map
                        .get(zone)
                        .map(|types| types.intersection(&wanted).cloned().collect())
                        .unwrap_or_default(),
                };
                (zone.clone(), offered)
            })
            .collect())
    }

    async fn instance_types(&self, instance_types: &[String]) -> ApiResult<Vec<InstanceTypeInfo>> {
        let state = self.enter("instance_types")?;
        Ok(instance_types
            .iter()
            .map(|t| {
                state.instance_info.get(t).cloned().unwrap_or(InstanceTypeInfo {
                    instance_type: t.clone(),
                    max_network_cards: 1,
                    efa_supported: false,
                })
            })
            .collect())
    }

    async fn endpoint_services(&self, service_names: &[String]) -> ApiResult<Vec<EndpointService>> {
        let state = self.enter("endpoint_services")?;
        let zones: Vec<String> = state
            .zones
            .iter()
            .filter(|(_, t)| **t == ZoneType::AvailabilityZone)
            .map(|(z, _)| z.clone())
            .collect();
        Ok(service_names
            .iter()
            .map(|name| EndpointService {
                service_name: name.clone(),
                endpoint_type: if name.ends_with(".s3") {
                    EndpointType::Gateway
                } else {
                    EndpointType::Interface
                },
                availability_zones: zones.clone(),
            })
            .collect())
    }

    async fn launch_template(
        &self,
        id: &str,
        _version: Option<&str>,
    ) -> ApiResult<LaunchTemplateData> {
        let state = self.enter("launch_template")?;
        state.launch_templates.get(id).cloned().ok_or_else(|| {
            ApiError::new(
                "InvalidLaunchTemplateId.NotFound",
                format!("launch template {} does not exist", id),
                false,
            )
        })
    }

    async fn route_tables(&self, subnet_ids: &[String]) -> ApiResult<BTreeMap<String, String>> {
        let state = self.enter("route_tables")?;
        Ok(subnet_ids
            .iter()
            .map(|id| {
                let rtb = state
                    .route_tables
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("rtb-{}", short_hash(&[id])));
                (id.clone(), rtb)
            })
            .collect())
    }
}
