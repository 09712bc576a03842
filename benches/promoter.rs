//! Benchmark for promoter configuration translation
//!
//! Covers descriptor to configuration, TOML rendering and parsing, and the
//! reverse translation List performs for every stored configuration.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ha_storage_gateway::domain::ports::{ResourceDefinition, VolumeDefinition};
use ha_storage_gateway::{Endpoint, IscsiTarget, NfsExport, PromoterConfig, VolumeConfig};

fn iscsi_target(volumes: u32) -> IscsiTarget {
    let mut target = IscsiTarget::new(
        "iqn.2019-08.com.example:bench".parse().unwrap(),
        vec!["192.168.122.181/24".parse().unwrap()],
        (1..=volumes)
            .map(|n| VolumeConfig::new(n, 1024 * 1024))
            .collect(),
    );
    target.fill_defaults();
    target
}

fn definitions(endpoint: &impl Endpoint) -> (ResourceDefinition, Vec<VolumeDefinition>) {
    let definition = ResourceDefinition {
        name: "bench".to_string(),
        resource_group: endpoint.resource_group().to_string(),
        ..Default::default()
    };
    let volumes = endpoint
        .storage_volumes()
        .iter()
        .map(|v| VolumeDefinition {
            number: v.number,
            size_kib: v.size_kib,
            gross: false,
        })
        .collect();
    (definition, volumes)
}

fn bench_to_promoter(c: &mut Criterion) {
    let mut group = c.benchmark_group("promoter");
    group.throughput(Throughput::Elements(1));

    let target = iscsi_target(8);
    group.bench_function("iscsi_to_promoter", |b| {
        b.iter(|| black_box(&target).to_promoter(&[]).unwrap());
    });

    let mut export = NfsExport::new(
        "bench",
        "10.0.0.5/16".parse().unwrap(),
        vec![VolumeConfig::new(1, 1024 * 1024)],
    );
    export.fill_defaults();
    group.bench_function("nfs_to_promoter", |b| {
        b.iter(|| black_box(&export).to_promoter(&[]).unwrap());
    });

    group.finish();
}

fn bench_toml(c: &mut Criterion) {
    let mut group = c.benchmark_group("promoter");
    group.throughput(Throughput::Elements(1));

    let cfg = iscsi_target(8).to_promoter(&[]).unwrap();
    let rendered = cfg.to_toml().unwrap();

    group.bench_function("to_toml", |b| {
        b.iter(|| black_box(&cfg).to_toml().unwrap());
    });

    group.bench_function("from_toml", |b| {
        b.iter(|| PromoterConfig::from_toml(black_box(&rendered)).unwrap());
    });

    group.finish();
}

fn bench_from_promoter(c: &mut Criterion) {
    let mut group = c.benchmark_group("promoter");
    group.throughput(Throughput::Elements(1));

    let target = iscsi_target(8);
    let cfg = target.to_promoter(&[]).unwrap();
    let (definition, volumes) = definitions(&target);

    group.bench_function("iscsi_from_promoter", |b| {
        b.iter(|| {
            IscsiTarget::from_promoter(black_box(&cfg), Some(&definition), &volumes).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_to_promoter, bench_toml, bench_from_promoter);
criterion_main!(benches);
