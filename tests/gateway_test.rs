//! # 网关编排集成测试
//!
//! 脚本化的上游适配器 + 进程内计数器 + sqlite 内存账本，结算在 `shutdown` 之后检查。

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use api_relay::app::{BackgroundPool, FatalEvent};
use api_relay::billing::BillingEngine;
use api_relay::config::{BillingConfig, GatewayConfig, LedgerConfig};
use api_relay::credential::CredentialService;
use api_relay::error::UpstreamError;
use api_relay::gateway::{
    AuditOutcome, AuditRecord, AuditSink, Gateway, GatewayComponents, ProviderAdapter,
    StreamFrame, UpstreamResponse,
};
use api_relay::ledger::{MemoryCounterStore, QuotaLedger, SeaOrmQuotaStore};
use api_relay::registry::Registry;
use api_relay::resolver::DispatchPlan;
use api_relay::selector::PoolSelector;
use api_relay::tokenizer::TiktokenCounter;
use api_relay::types::{GatewayRequest, Message, QuotaScope, RequestContext, Usage};
use api_relay::{ProxyError, Result};
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use mockall::mock;
use pretty_assertions::assert_eq;
use sea_orm::Database;
use tokio::sync::mpsc;

type UpstreamResult = std::result::Result<UpstreamResponse, UpstreamError>;

type Script = dyn Fn(&DispatchPlan, usize) -> UpstreamResult + Send + Sync;

/// 按脚本应答的上游，记录每次调用使用的密钥与请求
struct ScriptedAdapter {
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, GatewayRequest)>>,
    script: Box<Script>,
    frames: Vec<StreamFrame>,
}

impl ScriptedAdapter {
    fn new(
        script: impl Fn(&DispatchPlan, usize) -> UpstreamResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            script: Box::new(script),
            frames: Vec::new(),
        }
    }

    fn streaming(frames: Vec<StreamFrame>) -> Self {
        Self {
            frames,
            ..Self::new(|_, _| Ok(UpstreamResponse::default()))
        }
    }

    fn keys(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(key, _)| key.clone()).collect()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn call(
        &self,
        plan: &DispatchPlan,
        request: &GatewayRequest,
    ) -> std::result::Result<UpstreamResponse, UpstreamError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((plan.key().id.clone(), request.clone()));
        (self.script)(plan, n)
    }

    async fn stream(
        &self,
        plan: &DispatchPlan,
        request: &GatewayRequest,
    ) -> std::result::Result<mpsc::Receiver<StreamFrame>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((plan.key().id.clone(), request.clone()));
        let (tx, rx) = mpsc::channel(self.frames.len().max(1));
        for frame in &self.frames {
            tx.try_send(frame.clone()).unwrap();
        }
        Ok(rx)
    }
}

#[derive(Default)]
struct RecordingAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAudit {
    fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

mock! {
    Audit {}

    #[async_trait]
    impl AuditSink for Audit {
        async fn record(&self, record: AuditRecord) -> Result<()>;
    }
}

struct Harness {
    gateway: Gateway,
    adapter: Arc<ScriptedAdapter>,
    audit: Arc<RecordingAudit>,
    selector: Arc<PoolSelector>,
    credentials: Arc<CredentialService>,
    durable: Arc<SeaOrmQuotaStore>,
    fatal: Arc<Mutex<Vec<FatalEvent>>>,
}

impl Harness {
    async fn new(retry: i32, adapter: ScriptedAdapter) -> Self {
        let audit = Arc::new(RecordingAudit::default());
        Self::with_audit(retry, adapter, audit.clone(), audit).await
    }

    async fn with_audit(
        retry: i32,
        adapter: ScriptedAdapter,
        sink: Arc<dyn AuditSink>,
        audit: Arc<RecordingAudit>,
    ) -> Self {
        let config = GatewayConfig {
            retry,
            ..GatewayConfig::default()
        };
        Self::assemble(retry, adapter, sink, audit, common::resolving(&config)).await
    }

    async fn assemble(
        retry: i32,
        adapter: ScriptedAdapter,
        sink: Arc<dyn AuditSink>,
        audit: Arc<RecordingAudit>,
        resolving: common::Resolving,
    ) -> Self {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let durable = Arc::new(SeaOrmQuotaStore::new(Arc::new(db)));
        durable.open_account(QuotaScope::User, "u1", 1000).await.unwrap();
        let counters = Arc::new(MemoryCounterStore::new());
        counters.seed(QuotaScope::User, "u1", 1000);

        let fatal = Arc::new(Mutex::new(Vec::new()));
        let sink_fatal = fatal.clone();
        let pool = Arc::new(BackgroundPool::with_fatal_hook(
            2,
            64,
            Arc::new(move |event: FatalEvent| sink_fatal.lock().unwrap().push(event)),
        ));

        let adapter = Arc::new(adapter);
        let gateway = Gateway::new(GatewayComponents {
            resolver: resolving.resolver,
            selector: resolving.selector.clone(),
            billing: Arc::new(BillingEngine::new(
                Arc::new(TiktokenCounter::new("gpt-4o")),
                &BillingConfig::default(),
            )),
            ledger: Arc::new(QuotaLedger::new(
                counters,
                durable.clone(),
                &LedgerConfig {
                    max_attempts: 3,
                    backoff_unit_ms: 1,
                },
            )),
            audit: sink,
            adapter: adapter.clone(),
            pool,
            retry,
        });

        Self {
            gateway,
            adapter,
            audit,
            selector: resolving.selector,
            credentials: resolving.credentials,
            durable,
            fatal,
        }
    }

    async fn user_balance(&self) -> (i64, i64) {
        let account = self
            .durable
            .account(QuotaScope::User, "u1")
            .await
            .unwrap()
            .unwrap();
        (account.quota, account.used_quota)
    }

    /// 等待后台结算完成并确认没有致命故障
    async fn settle(&self) {
        self.gateway.shutdown().await;
        assert!(self.fatal.lock().unwrap().is_empty());
    }
}

fn ctx() -> RequestContext {
    RequestContext::new("u1", "a1", "ak1").with_request_id("req-gw")
}

fn ask(model: &str) -> GatewayRequest {
    GatewayRequest::chat(model, vec![Message::user("hello")])
}

fn answer(prompt: i64, completion: i64) -> UpstreamResponse {
    UpstreamResponse {
        usage: Some(Usage::new(prompt, completion)),
        completion: "ok".to_string(),
        ..UpstreamResponse::default()
    }
}

fn spend_of(record: &AuditRecord) -> i64 {
    record.spend.as_ref().map_or(0, |spend| spend.total_spend_tokens)
}

#[tokio::test]
async fn test_transient_error_is_retried_then_billed() {
    let h = Harness::new(
        3,
        ScriptedAdapter::new(|_, n| {
            if n == 0 {
                Err(UpstreamError::transport("connection reset"))
            } else {
                Ok(answer(10, 5))
            }
        }),
    )
    .await;

    let response = h.gateway.execute(&ctx(), &ask("gpt-4o")).await.unwrap();
    h.settle().await;

    assert_eq!(response.usage, Some(Usage::new(10, 5)));
    assert_eq!(h.adapter.keys(), vec!["k1", "k1"]);

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Success);
    assert_eq!(records[0].attempt, 1);
    assert_eq!(spend_of(&records[0]), 10 + 2 * 5);
    assert_eq!(h.user_balance().await, (980, 20));
}

#[tokio::test]
async fn test_preset_is_applied_to_upstream_request() {
    let h = Harness::new(3, ScriptedAdapter::new(|_, _| Ok(answer(1, 1)))).await;

    h.gateway.execute(&ctx(), &ask("gpt-4o")).await.unwrap();
    h.settle().await;

    let seen = h.adapter.seen.lock().unwrap();
    let request = &seen[0].1;
    assert_eq!(request.max_tokens, Some(256));
    assert_eq!(request.messages[0].role, "system");
    assert_eq!(request.messages.len(), 2);
}

#[tokio::test]
async fn test_insufficient_quota_disables_key_and_falls_back() {
    let h = Harness::new(
        3,
        ScriptedAdapter::new(|plan, _| {
            if plan.key().id == "k1" {
                Err(UpstreamError::api(
                    429,
                    Some("insufficient_quota"),
                    "You exceeded your current quota",
                ))
            } else {
                Ok(answer(10, 5))
            }
        }),
    )
    .await;

    h.gateway.execute(&ctx(), &ask("gpt-4o")).await.unwrap();
    h.settle().await;

    assert!(h.selector.is_key_disabled("k1"));
    assert_eq!(h.adapter.keys(), vec!["k1", "k2"]);

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.outcome, AuditOutcome::Success);
    assert_eq!(record.req_model.as_deref(), Some("m-gpt4o"));
    assert_eq!(record.real_model.as_deref(), Some("m-mini"));
    assert!(record.is_fallback);
    // 按实际模型的价格计费
    assert_eq!(spend_of(record), 15);
    assert_eq!(h.user_balance().await, (985, 15));
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails_the_request() {
    let h = Harness::new(
        2,
        ScriptedAdapter::new(|_, _| Err(UpstreamError::transport("timeout"))),
    )
    .await;

    let err = h
        .gateway
        .execute(&ctx(), &ask("text-embedding-3"))
        .await
        .unwrap_err();
    h.settle().await;

    assert!(matches!(err, ProxyError::Upstream(UpstreamError::Transport(_))), "{err}");
    // 首次调用加两次重试
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 3);

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Failed);
    assert_eq!(records[0].attempt, 2);
    assert!(records[0].spend.is_none());
    assert_eq!(h.user_balance().await, (1000, 0));
}

#[tokio::test]
async fn test_context_length_error_is_terminal() {
    let h = Harness::new(
        3,
        ScriptedAdapter::new(|_, _| {
            Err(UpstreamError::api(
                400,
                Some("context_length_exceeded"),
                "This model's maximum context length is 128000 tokens",
            ))
        }),
    )
    .await;

    let err = h.gateway.execute(&ctx(), &ask("gpt-4o")).await.unwrap_err();
    h.settle().await;

    assert!(matches!(err, ProxyError::Upstream(UpstreamError::Api { status: 400, .. })));
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 1);
    assert!(!h.selector.is_key_disabled("k1"));
    assert_eq!(h.audit.records()[0].outcome, AuditOutcome::Failed);
    assert_eq!(h.user_balance().await, (1000, 0));
}

#[tokio::test]
async fn test_cancelled_request_is_billed_with_partial_usage() {
    let h = Harness::new(
        3,
        ScriptedAdapter::new(|_, _| {
            Err(UpstreamError::Cancelled {
                partial_usage: Some(Usage::new(30, 4)),
            })
        }),
    )
    .await;

    let err = h.gateway.execute(&ctx(), &ask("gpt-4o")).await.unwrap_err();
    h.settle().await;

    assert!(matches!(err, ProxyError::Upstream(UpstreamError::Cancelled { .. })));
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 1);

    let records = h.audit.records();
    assert_eq!(records[0].outcome, AuditOutcome::Aborted);
    assert!(records[0].error.is_some());
    assert_eq!(spend_of(&records[0]), 30 + 2 * 4);
    assert_eq!(h.user_balance().await, (962, 38));
}

#[tokio::test]
async fn test_stream_is_billed_after_last_frame() {
    let h = Harness::new(
        3,
        ScriptedAdapter::streaming(vec![
            StreamFrame::Delta("你好".to_string()),
            StreamFrame::Delta("世界".to_string()),
            StreamFrame::Usage(Usage::new(12, 3)),
        ]),
    )
    .await;

    let mut receiver = h
        .gateway
        .execute_stream(&ctx(), &ask("gpt-4o"))
        .await
        .unwrap();
    let mut text = String::new();
    let mut frames = 0;
    while let Some(frame) = receiver.recv().await {
        frames += 1;
        if let StreamFrame::Delta(delta) = frame {
            text.push_str(&delta);
        }
    }
    h.settle().await;

    assert_eq!(frames, 3);
    assert_eq!(text, "你好世界");

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Success);
    assert_eq!(spend_of(&records[0]), 12 + 2 * 3);
    assert_eq!(h.user_balance().await, (982, 18));
}

#[tokio::test]
async fn test_broken_stream_is_billed_as_aborted() {
    let h = Harness::new(
        3,
        ScriptedAdapter::streaming(vec![
            StreamFrame::Delta("半句".to_string()),
            StreamFrame::Error(UpstreamError::BrokenPipe {
                message: "connection reset by peer".to_string(),
                partial_usage: Some(Usage::new(8, 1)),
            }),
        ]),
    )
    .await;

    let mut receiver = h
        .gateway
        .execute_stream(&ctx(), &ask("gpt-4o"))
        .await
        .unwrap();
    let mut last = None;
    while let Some(frame) = receiver.recv().await {
        last = Some(frame);
    }
    h.settle().await;

    assert!(matches!(last, Some(StreamFrame::Error(UpstreamError::BrokenPipe { .. }))));

    let records = h.audit.records();
    assert_eq!(records[0].outcome, AuditOutcome::Aborted);
    assert_eq!(spend_of(&records[0]), 8 + 2);
    assert_eq!(h.user_balance().await, (990, 10));
}

#[tokio::test]
async fn test_resolve_failure_is_audited_without_plan() {
    let mut sink = MockAudit::new();
    sink.expect_record()
        .withf(|record| {
            record.outcome == AuditOutcome::Failed
                && record.req_model.is_none()
                && record.key_id.is_none()
                && record.error.is_some()
        })
        .times(1)
        .returning(|_| Ok(()));

    let h = Harness::with_audit(
        3,
        ScriptedAdapter::new(|_, _| Ok(answer(1, 1))),
        Arc::new(sink),
        Arc::new(RecordingAudit::default()),
    )
    .await;

    let err = h.gateway.execute(&ctx(), &ask("no-such-model")).await.unwrap_err();
    h.settle().await;

    assert!(matches!(err, ProxyError::ModelNotFound { .. }));
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_requests_after_shutdown_are_rejected_before_upstream() {
    let h = Harness::new(3, ScriptedAdapter::new(|_, _| Ok(answer(10, 5)))).await;
    h.settle().await;

    let err = h.gateway.execute(&ctx(), &ask("gpt-4o")).await.unwrap_err();
    assert!(matches!(err, ProxyError::Internal { .. }), "{err}");
    let err = h
        .gateway
        .execute_stream(&ctx(), &ask("gpt-4o"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Internal { .. }), "{err}");

    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 0);
    assert!(h.audit.records().is_empty());
    assert!(h.fatal.lock().unwrap().is_empty());
    assert_eq!(h.user_balance().await, (1000, 0));
}

#[tokio::test]
async fn test_settlement_outlives_cancelled_caller() {
    let h = Arc::new(Harness::new(3, ScriptedAdapter::new(|_, _| Ok(answer(10, 5)))).await);

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let caller = {
        let h = h.clone();
        tokio::spawn(async move {
            h.gateway.execute(&ctx(), &ask("gpt-4o")).await.unwrap();
            let _ = done_tx.send(());
            std::future::pending::<()>().await;
        })
    };
    done_rx.await.unwrap();
    caller.abort();
    let _ = caller.await;
    h.settle().await;

    assert_eq!(h.audit.records().len(), 1);
    assert_eq!(h.user_balance().await, (980, 20));
}

#[tokio::test]
async fn test_rejected_exchanged_token_is_dropped_from_cache() {
    let exchanger = Arc::new(common::ScriptedExchanger::issuing());
    let snapshot = common::with_oauth_azure(common::snapshot());
    let azure = common::provider(&snapshot, "azure");
    let resolving =
        common::resolving_from(snapshot, exchanger.clone(), &GatewayConfig::default());
    let registry = resolving.registry.clone();
    let audit = Arc::new(RecordingAudit::default());
    let h = Harness::assemble(
        3,
        ScriptedAdapter::new(|plan, _| {
            if plan.credential == "token-0" {
                Err(UpstreamError::api(401, Some("invalid_client"), "token revoked"))
            } else {
                Ok(answer(1, 1))
            }
        }),
        audit.clone(),
        audit,
        resolving,
    )
    .await;
    let ctx = RequestContext::new("u1", "a1", "ak-agents").with_request_id("req-gw");

    let err = h.gateway.execute(&ctx, &ask("gpt-4o")).await.unwrap_err();
    h.settle().await;

    // 唯一的代理密钥被禁用后，分组代理路由下已无可用代理
    assert!(matches!(err, ProxyError::NoAvailableAgent { .. }), "{err}");
    assert!(h.selector.is_key_disabled("k-az"));
    assert_eq!(exchanger.calls(), 1);

    let key = registry.keys_for_agent("ag1").await.unwrap().remove(0);
    let token = h.credentials.credential("req-gw", &azure, &key).await.unwrap();
    assert_eq!(token, "token-1");
    assert_eq!(exchanger.calls(), 2);
}
