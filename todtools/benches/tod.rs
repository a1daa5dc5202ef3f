#[allow(unused_imports)]
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use todtools::{TimeValue, Tod};

fn parse_canonical(c: &mut Criterion) {
    c.bench_function("parse_canonical", |b| {
        b.iter(|| {
            let t: Tod = black_box("12h34:56.789012").parse().unwrap();
            let _ = black_box(t);
        })
    });
}

fn parse_decimal(c: &mut Criterion) {
    c.bench_function("parse_decimal", |b| {
        b.iter(|| {
            let t: Tod = black_box("45296.789012").parse().unwrap();
            let _ = black_box(t);
        })
    });
}

fn format_timestr(c: &mut Criterion) {
    let t: Tod = "12h34:56.789012".parse().unwrap();
    c.bench_function("format_timestr", |b| {
        b.iter(|| {
            let _ = black_box(t.timestr(4));
        })
    });
}

fn net_time(c: &mut Criterion) {
    let a: Tod = "0:00:05.5".parse().unwrap();
    let b: Tod = "23h59:58.25".parse().unwrap();
    c.bench_function("net_time", |bench| {
        bench.iter(|| {
            let _ = black_box(&a - &b);
        })
    });
}

criterion_group!(benches, parse_canonical, parse_decimal, format_timestr, net_time);
criterion_main!(benches);
