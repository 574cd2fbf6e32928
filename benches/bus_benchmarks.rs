//! Performance benchmarks for the message bus hot paths.
//!
//! Benchmarks cover:
//!   - Direct send + receive through a priority inbox
//!   - Broadcast fan-out
//!   - Request/response round trip through an agent runtime
//!
//! Run: `cargo bench`

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use swarmbus::config::BusConfig;
use swarmbus::{
    AgentContext, Config, Message, MessageBus, MessageHandler, Outbound, Priority, Swarm,
};
use swarmbus::observability::NoopSink;

use async_trait::async_trait;

struct BenchEcho;

#[async_trait]
impl MessageHandler for BenchEcho {
    async fn process_message(
        &self,
        _ctx: &AgentContext,
        message: Message,
    ) -> anyhow::Result<Option<Outbound>> {
        let content = message.content.clone();
        Ok(Some(Outbound::reply_to(&message, "echo", content)))
    }
}

fn bench_send_receive(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let bus = MessageBus::new(BusConfig::default());
    bus.register("producer", 0).unwrap();
    bus.register("consumer", 0).unwrap();

    c.bench_function("bus_send_receive", |b| {
        b.iter(|| {
            rt.block_on(async {
                bus.send(
                    Message::new("producer", "consumer", "tick", json!({"n": 1}))
                        .with_priority(Priority::Normal),
                )
                .unwrap();
                black_box(bus.receive("consumer", Duration::from_secs(1)).await.unwrap())
            })
        });
    });

    c.bench_function("bus_priority_burst_64", |b| {
        b.iter(|| {
            rt.block_on(async {
                for n in 0..64 {
                    let priority = if n % 4 == 0 { Priority::High } else { Priority::Low };
                    bus.send(Message::new("producer", "consumer", "tick", json!(n)).with_priority(priority))
                        .unwrap();
                }
                for _ in 0..64 {
                    black_box(bus.receive("consumer", Duration::from_secs(1)).await.unwrap());
                }
            })
        });
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let bus = MessageBus::new(BusConfig::default());
    let agents: Vec<String> = (0..16).map(|n| format!("agent-{n}")).collect();
    for agent in &agents {
        bus.register(agent, 0).unwrap();
    }

    c.bench_function("bus_broadcast_16", |b| {
        b.iter(|| {
            rt.block_on(async {
                let delivered = bus
                    .broadcast(Message::new("agent-0", "*", "status", json!({"ok": true})), &[])
                    .unwrap();
                for agent in &agents[1..] {
                    bus.receive(agent, Duration::from_secs(1)).await.unwrap();
                }
                black_box(delivered)
            })
        });
    });
}

fn bench_request_response(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let swarm = rt.block_on(async {
        let swarm = Swarm::new(Config::default(), Arc::new(NoopSink));
        swarm.spawn_agent("echo", Arc::new(BenchEcho)).await.unwrap();
        swarm.bus().register("client", 0).unwrap();
        swarm
    });

    c.bench_function("runtime_request_response", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    swarm
                        .bus()
                        .request("client", "echo", "ping", "hi", Priority::Normal, Duration::from_secs(1))
                        .await
                        .unwrap(),
                )
            })
        });
    });

    rt.block_on(swarm.shutdown());
}

criterion_group!(
    benches,
    bench_send_receive,
    bench_broadcast,
    bench_request_response
);
criterion_main!(benches);
