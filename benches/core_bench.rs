//! Benchmarks for clusterforge core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use clusterforge::builder::vpc::add_vpc_resources;
use clusterforge::core::cidr::{Ipv4Cidr, DEFAULT_VPC_CIDR};
use clusterforge::core::parser::{apply_defaults, parse_config, validate_config};
use clusterforge::core::template::ResourceSet;
use clusterforge::stack::render_cluster;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const CLUSTER: &str = r#"
metadata:
  name: bench
  region: us-west-2
accessEntries:
  - principalARN: arn:aws:iam::111122223333:role/admin
    accessPolicies:
      - policyARN: arn:aws:eks::aws:cluster-access-policy/AmazonEKSAdminPolicy
        accessScope: {type: cluster}
nodeGroups:
  - name: ng-1
    instanceType: m5.large
    desiredCapacity: 3
managedNodeGroups:
  - name: mng-1
    instanceType: m5.large
    privateNetworking: true
"#;

fn loaded() -> clusterforge::core::types::ClusterConfig {
    let mut cfg = parse_config(CLUSTER).unwrap();
    apply_defaults(&mut cfg).unwrap();
    cfg
}

fn bench_config_parse(c: &mut Criterion) {
    c.bench_function("config_parse_validate_default", |b| {
        b.iter(|| {
            let mut cfg = parse_config(black_box(CLUSTER)).unwrap();
            assert!(validate_config(&cfg).is_empty());
            apply_defaults(&mut cfg).unwrap();
            black_box(cfg);
        });
    });
}

fn bench_cidr_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("cidr_partition");
    for count in [4u32, 16, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| black_box(DEFAULT_VPC_CIDR.partition(black_box(count), 8).unwrap()));
        });
    }
    group.finish();

    let wide: Ipv4Cidr = "10.0.0.0/8".parse().unwrap();
    c.bench_function("cidr_split_into_subnets", |b| {
        b.iter(|| black_box(wide.split_into(black_box(6), 19).unwrap()));
    });
}

fn bench_vpc_template(c: &mut Criterion) {
    let cfg = loaded();
    c.bench_function("vpc_template_render_and_hash", |b| {
        b.iter(|| {
            let mut rs = ResourceSet::new("bench");
            add_vpc_resources(&mut rs, black_box(&cfg)).unwrap();
            black_box(rs.finish().unwrap().hash);
        });
    });
}

fn bench_render_cluster(c: &mut Criterion) {
    let cfg = loaded();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .unwrap();
    c.bench_function("render_cluster_simulated", |b| {
        b.iter(|| {
            let (templates, _) = runtime.block_on(render_cluster(black_box(&cfg))).unwrap();
            black_box(templates);
        });
    });
}

criterion_group!(
    benches,
    bench_config_parse,
    bench_cidr_partition,
    bench_vpc_template,
    bench_render_cluster,
);
criterion_main!(benches);
