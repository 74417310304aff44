//! CF-007: Reference validation and dependency ordering.
//!
//! Every Ref/GetAtt/Sub/DependsOn target in a template must name a resource
//! or parameter of the same template. Edges from those references form a
//! DAG; topological order uses Kahn's algorithm with alphabetical
//! tie-breaking so the same template always yields the same order. The same
//! ordering is used for stacks that import each other's exports.

use super::template::Template;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Dependencies of each resource: explicit DependsOn plus embedded references.
pub fn resource_dependencies(template: &Template) -> BTreeMap<String, BTreeSet<String>> {
    template
        .resources
        .iter()
        .map(|(name, resource)| {
            let mut deps: BTreeSet<String> = resource
                .properties
                .values()
                .flat_map(|v| v.referenced_names())
                .collect();
            deps.extend(resource.depends_on.iter().cloned());
            // parameters are not graph nodes
            deps.retain(|d| !template.parameters.contains_key(d));
            (name.clone(), deps)
        })
        .collect()
}

/// Check every reference resolves, then check the graph is acyclic.
pub fn validate_references(template: &Template) -> Result<()> {
    let known = |name: &str| {
        template.resources.contains_key(name) || template.parameters.contains_key(name)
    };

    for (name, deps) in resource_dependencies(template) {
        if let Some(target) = deps.iter().find(|d| !known(d)) {
            return Err(Error::UnknownReference {
                resource: name,
                target: target.clone(),
            });
        }
    }

    for (name, output) in &template.outputs {
        let mut refs = output.value.referenced_names();
        if let Some(ref export) = output.export {
            refs.extend(export.name.referenced_names());
        }
        if let Some(target) = refs.iter().find(|d| !known(d)) {
            return Err(Error::UnknownReference {
                resource: format!("Outputs.{}", name),
                target: target.clone(),
            });
        }
    }

    creation_order(template).map(|_| ())
}

/// Order in which the provisioning API may create the template's resources.
pub fn creation_order(template: &Template) -> Result<Vec<String>> {
    topo_order(&resource_dependencies(template))
}

/// Kahn's algorithm over `node -> dependencies`, alphabetical tie-breaking.
/// Dependencies that are not nodes themselves are ignored.
pub fn topo_order(graph: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = graph.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (node, deps) in graph {
        for dep in deps {
            if !graph.contains_key(dep) {
                continue;
            }
            dependents.entry(dep.as_str()).or_default().push(node.as_str());
            if let Some(d) = in_degree.get_mut(node.as_str()) {
                *d += 1;
            }
        }
    }

    // BTreeMap iteration is already sorted
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        if let Some(neighbors) = dependents.get(current) {
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(neighbor);
                    }
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != graph.len() {
        let ordered: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let names = graph
            .keys()
            .filter(|k| !ordered.contains(k.as_str()))
            .cloned()
            .collect();
        return Err(Error::DependencyCycle { names });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::intrinsic::Value;
    use crate::core::template::{Resource, ResourceKind, ResourceSet};

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(n, deps)| (n.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_cf007_topo_linear() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(topo_order(&g).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cf007_topo_parallel_alphabetical() {
        let g = graph(&[("beta", &[]), ("alpha", &[])]);
        assert_eq!(topo_order(&g).unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_cf007_topo_diamond() {
        let g = graph(&[
            ("top", &[]),
            ("left", &["top"]),
            ("right", &["top"]),
            ("bottom", &["left", "right"]),
        ]);
        let order = topo_order(&g).unwrap();
        assert_eq!(order, vec!["top", "left", "right", "bottom"]);
    }

    #[test]
    fn test_cf007_topo_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        match topo_order(&g).unwrap_err() {
            Error::DependencyCycle { names } => assert_eq!(names, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cf007_references_from_sub_and_getatt() {
        let mut set = ResourceSet::new("t");
        set.add_resource("VPC", Resource::new(ResourceKind::Vpc))
            .unwrap();
        set.add_resource(
            "SG",
            Resource::new(ResourceKind::SecurityGroup)
                .with("VpcId", Value::get_att("VPC", "VpcId"))
                .with("GroupDescription", Value::sub("${VPC} in ${AWS::Region}")),
        )
        .unwrap();
        let order = creation_order(set.template()).unwrap();
        assert_eq!(order, vec!["VPC", "SG"]);
        assert!(validate_references(set.template()).is_ok());
    }

    #[test]
    fn test_cf007_unknown_depends_on() {
        let mut set = ResourceSet::new("t");
        set.add_resource(
            "Route",
            Resource::new(ResourceKind::Route).depends_on("VPCGatewayAttachment"),
        )
        .unwrap();
        match validate_references(set.template()).unwrap_err() {
            Error::UnknownReference { resource, target } => {
                assert_eq!(resource, "Route");
                assert_eq!(target, "VPCGatewayAttachment");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cf007_unknown_output_reference() {
        let mut set = ResourceSet::new("t");
        set.define_output_without_collector("VPC", Value::reference("VPC"), true)
            .unwrap();
        let err = validate_references(set.template()).unwrap_err();
        assert!(err.to_string().contains("Outputs.VPC"));
    }
}
