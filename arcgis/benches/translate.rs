//! Benchmarks pour la conversion des géométries

use arcgis::{translate, DestinationGeometryKind, GeometryPayload};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

/// Polygone avec `holes` trous et `vertices` sommets par anneau
fn polygon_payload(vertices: usize, holes: usize) -> GeometryPayload {
    fn ring(cx: f64, cy: f64, r: f64, n: usize, clockwise: bool) -> Vec<Vec<f64>> {
        let mut points: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let a = i as f64 / n as f64 * std::f64::consts::TAU;
                vec![cx + r * a.cos(), cy + r * a.sin()]
            })
            .collect();
        if clockwise {
            points.reverse();
        }
        let first = points[0].clone();
        points.push(first);
        points
    }

    let mut rings = vec![ring(0.0, 0.0, 1000.0, vertices, true)];
    for h in 0..holes {
        let offset = h as f64 * 50.0 - 400.0;
        rings.push(ring(offset, 0.0, 10.0, vertices, false));
    }
    serde_json::from_value(json!({ "rings": rings })).unwrap()
}

fn bench_polygons(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate_polygon");

    for vertices in [16, 256, 4096] {
        let payload = polygon_payload(vertices, 4);
        group.throughput(Throughput::Elements(vertices as u64 * 5));
        group.bench_with_input(
            BenchmarkId::from_parameter(vertices),
            &payload,
            |b, payload| {
                b.iter(|| {
                    let geometry = translate(
                        Some(black_box(payload)),
                        DestinationGeometryKind::MultiPolygon,
                        None,
                    )
                    .unwrap();
                    black_box(geometry)
                })
            },
        );
    }

    group.finish();
}

fn bench_decode_page(c: &mut Criterion) {
    let features: Vec<_> = (0..1000)
        .map(|i| {
            json!({
                "attributes": {"OBJECTID": i, "STATUS": i % 3, "NAME": format!("feature {i}")},
                "geometry": {"paths": [[[i, 0], [i, 1], [i + 1, 1]]]}
            })
        })
        .collect();
    let page = serde_json::to_vec(&json!({ "features": features })).unwrap();

    let mut group = c.benchmark_group("decode_page");
    group.throughput(Throughput::Bytes(page.len() as u64));
    group.bench_function("1000_polylines", |b| {
        b.iter(|| {
            let value: serde_json::Value = serde_json::from_slice(black_box(&page)).unwrap();
            let features: Vec<arcgis::RawFeature> =
                serde_json::from_value(value["features"].clone()).unwrap();
            black_box(features)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_polygons, bench_decode_page);
criterion_main!(benches);
