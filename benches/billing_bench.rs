//! # 计费与记账基准测试

use std::hint::black_box;
use std::sync::Arc;

use api_relay::billing::{BillingEngine, BillingInput};
use api_relay::config::BillingConfig;
use api_relay::ledger::{CounterStore, MemoryCounterStore};
use api_relay::registry::Model;
use api_relay::tokenizer::TiktokenCounter;
use api_relay::types::{GatewayRequest, Message, QuotaScope, Usage};
use criterion::{Criterion, criterion_group, criterion_main};
use tokio::runtime::Runtime;

fn text_model() -> Model {
    serde_json::from_value(serde_json::json!({
        "id": "m1",
        "name": "gpt-4o",
        "model": "gpt-4o",
        "provider_id": "openai",
        "pricing": {
            "text": [{ "input_ratio": 1.0, "output_ratio": 2.0 }],
            "text_cache": [{ "read_ratio": 0.5, "write_ratio": 1.25 }]
        }
    }))
    .unwrap()
}

/// 有用量与需要重新计数两条路径
pub fn billing_benchmark(c: &mut Criterion) {
    let engine = BillingEngine::new(
        Arc::new(TiktokenCounter::new("gpt-4o")),
        &BillingConfig::default(),
    );
    let model = text_model();
    let request = GatewayRequest::chat(
        "gpt-4o",
        vec![
            Message::system("You are a helpful assistant."),
            Message::user("Summarize the following paragraph in two sentences. ".repeat(20)),
        ],
    );
    let usage = Usage::new(1200, 300);

    c.bench_function("billing_with_usage", |b| {
        let input = BillingInput::new("bench", &request).with_usage(Some(&usage));
        b.iter(|| engine.billing_for(black_box(&model), "m1", None, black_box(&input), None));
    });

    c.bench_function("billing_recount", |b| {
        let input = BillingInput::new("bench", &request)
            .with_completion("Sure, here is a short summary.");
        b.iter(|| engine.billing_for(black_box(&model), "m1", None, black_box(&input), None));
    });
}

/// 进程内计数器的原子扣减
pub fn counter_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let counters = MemoryCounterStore::new();
    counters.seed(QuotaScope::User, "u1", i64::MAX / 2);

    c.bench_function("memory_counter_incr", |b| {
        b.iter(|| {
            rt.block_on(counters.incr(QuotaScope::User, black_box("u1"), -10))
                .unwrap()
        });
    });
}

criterion_group!(benches, billing_benchmark, counter_benchmark);
criterion_main!(benches);
