//! Benchmarks for topic tree resolution and push fan-out
//!
//! Run with: cargo bench

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};
use std::sync::Arc;
use xbgw_streams::streams::{listener, DeviceKey, FetchError, Topic, TopicTree};
use xbgw_streams::{Dispatcher, HistorySource};

struct NoHistory;

#[async_trait]
impl HistorySource for NoHistory {
    async fn fetch_history(&self, _device_id: &str, _topic: &str) -> Result<Value, FetchError> {
        Ok(json!({"items": []}))
    }
}

fn radio(i: usize) -> String {
    format!("[00:13:A2:00:40:A0:{:02X}:{:02X}]!", i / 256, i % 256)
}

fn populated_tree(devices: usize, radios: usize) -> TopicTree {
    let mut tree = TopicTree::new();
    for d in 0..devices {
        let device = DeviceKey::Device(format!("dev{}", d));
        for r in 0..radios {
            for pin in ["DIO0", "DIO1", "AD1", "AD2"] {
                let topic = Topic::parse(&format!("xbee.analog/{}/{}", radio(r), pin));
                tree.register(&device, &topic, listener(|_, _, _, _| {}));
            }
        }
        let any_radio = Topic::parse("xbee.analog/[!]/AD1");
        tree.register(&device, &any_radio, listener(|_, _, _, _| {}));
    }
    tree
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for devices in [1, 10, 100] {
        let tree = populated_tree(devices, 16);
        let topic = Topic::parse(&format!("xbee.analog/{}/AD1", radio(7)));

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("devices_{}", devices), |b| {
            b.iter(|| tree.resolve(black_box("dev0"), black_box(&topic)))
        });
    }

    group.finish();
}

fn bench_register_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_release");

    group.bench_function("mount_unmount", |b| {
        let mut tree = populated_tree(10, 16);
        let device = DeviceKey::Device("dev3".to_string());
        let topic = Topic::parse("xbee.digitalIn/[00:13:A2:00:40:A0:44:33]!/DIO4");

        b.iter(|| {
            let id = tree.register(&device, &topic, listener(|_, _, _, _| {}));
            tree.release(&device, &topic, black_box(id))
        });
    });

    group.finish();
}

fn bench_new_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("new_data");

    let dispatcher = Dispatcher::new(Arc::new(NoHistory));
    let topic = format!("xbee.analog/{}/AD1", radio(7));
    let _subs: Vec<_> = (0..8)
        .map(|_| dispatcher.listen("dev0", &topic, |point, _, _, _| {
            let _ = black_box(point);
        }))
        .chain(std::iter::once(
            dispatcher.listen("!", "xbee.analog/[!]/AD1", |_, _, _, _| {}),
        ))
        .collect();

    let message = json!({"DataPoint": {
        "streamId": format!("dev0/{}", topic),
        "data": "512",
        "timestamp": "1404150843000"
    }});

    group.throughput(Throughput::Elements(9));
    group.bench_function("fan_out_9", |b| {
        b.iter(|| dispatcher.new_data(black_box(&message)))
    });

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_register_release, bench_new_data);
criterion_main!(benches);
