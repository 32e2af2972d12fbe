//! # 网关编排
//!
//! 一次请求的完整生命周期：解析调度计划，调用上游，失败时交给故障转移控制器
//! 决定重试或回退；成功或中断后把计费、记账与审计提交到后台任务池。
//! 流式请求在最后一帧之后结算。结算以移交方式提交，不受请求取消影响。

mod adapter;
mod audit;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;

pub use adapter::{ProviderAdapter, StreamFrame, UpstreamResponse};
pub use audit::{AuditOutcome, AuditRecord, AuditSink, TracingAuditSink};

use crate::app::BackgroundPool;
use crate::billing::{BillingEngine, BillingInput};
use crate::cache::CacheClient;
use crate::config::{AppConfig, CacheType};
use crate::credential::{ClientCredentialsExchanger, CredentialService};
use crate::error::{ProxyError, Result};
use crate::failover::{Decision, FailoverController, classify, is_aborted};
use crate::ledger::{
    CounterStore, LedgerEntry, MemoryCounterStore, QuotaLedger, RedisCounterStore,
    SeaOrmQuotaStore,
};
use crate::logging::{LogComponent, LogStage};
use crate::registry::Registry;
use crate::resolver::{DispatchPlan, ResolveArgs, Resolver, RetryContext, apply_preset};
use crate::selector::{PoolSelector, Selector};
use crate::tokenizer::{TiktokenCounter, Tokenizer};
use crate::types::{GatewayRequest, RequestContext, Usage};
use crate::{ldebug, linfo, lwarn};

/// 流式转发通道容量
const STREAM_BUFFER: usize = 64;

/// 网关依赖的组件
pub struct GatewayComponents {
    pub resolver: Arc<Resolver>,
    pub selector: Arc<dyn Selector>,
    pub billing: Arc<BillingEngine>,
    pub ledger: Arc<QuotaLedger>,
    pub audit: Arc<dyn AuditSink>,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub pool: Arc<BackgroundPool>,
    /// 重试预算，与解析器使用同一个值
    pub retry: i32,
}

pub struct Gateway {
    resolver: Arc<Resolver>,
    selector: Arc<dyn Selector>,
    failover: FailoverController,
    adapter: Arc<dyn ProviderAdapter>,
    settler: Settler,
    accepting: AtomicBool,
}

/// 失败后的下一步
enum Flow {
    Continue {
        args: ResolveArgs,
        retry: RetryContext,
    },
    Stop(ProxyError),
}

impl Gateway {
    pub fn new(components: GatewayComponents) -> Self {
        let GatewayComponents {
            resolver,
            selector,
            billing,
            ledger,
            audit,
            adapter,
            pool,
            retry,
        } = components;
        Self {
            resolver,
            failover: FailoverController::new(selector.clone(), retry),
            selector,
            adapter,
            settler: Settler {
                billing,
                ledger,
                audit,
                pool,
            },
            accepting: AtomicBool::new(true),
        }
    }

    /// 按应用配置装配全部组件
    pub async fn build(
        config: &AppConfig,
        registry: Arc<dyn Registry>,
        adapter: Arc<dyn ProviderAdapter>,
        db: Arc<DatabaseConnection>,
    ) -> Result<Self> {
        let remote = match config.cache.cache_type {
            CacheType::Redis => {
                let redis = config
                    .cache
                    .redis
                    .clone()
                    .ok_or_else(|| ProxyError::config("缓存类型为 redis 但缺少 redis 配置"))?;
                Some(CacheClient::new(redis).await?)
            }
            CacheType::Memory => None,
        };
        let counters: Arc<dyn CounterStore> = match &remote {
            Some(client) => Arc::new(RedisCounterStore::new(client.clone())),
            None => Arc::new(MemoryCounterStore::new()),
        };

        let selector: Arc<dyn Selector> =
            Arc::new(PoolSelector::new(registry.clone(), &config.selector));
        let credentials = Arc::new(CredentialService::new(
            Arc::new(ClientCredentialsExchanger::new()),
            remote,
            &config.credential,
        ));
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(TiktokenCounter::new(
            config.gateway.default_tokenizer_model.clone(),
        ));

        linfo!("system", LogStage::Startup, LogComponent::Gateway, "gateway_build", "网关组件装配完成", cache_type = ?config.cache.cache_type, retry = config.gateway.retry);

        Ok(Self::new(GatewayComponents {
            resolver: Arc::new(Resolver::new(
                registry,
                selector.clone(),
                credentials,
                &config.gateway,
            )),
            selector,
            billing: Arc::new(BillingEngine::new(tokenizer, &config.billing)),
            ledger: Arc::new(QuotaLedger::new(
                counters,
                Arc::new(SeaOrmQuotaStore::new(db)),
                &config.ledger,
            )),
            audit: Arc::new(TracingAuditSink),
            adapter,
            pool: Arc::new(BackgroundPool::new(&config.gateway)),
            retry: config.gateway.retry,
        }))
    }

    /// 非流式调用
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        request: &GatewayRequest,
    ) -> Result<UpstreamResponse> {
        self.ensure_accepting(ctx)?;
        let rid = ctx.request_id.as_str();
        let mut args = ResolveArgs::default();
        let mut retry = RetryContext::new();

        loop {
            let (plan, upstream_request) = self.prepare(ctx, request, &args, &retry).await?;
            match self.adapter.call(&plan, &upstream_request).await {
                Ok(response) => {
                    self.selector.record_success(plan.key(), plan.agent()).await;
                    linfo!(rid, LogStage::Upstream, LogComponent::Gateway, "upstream_success", "上游调用成功", real_model = %plan.real_model.model, key_id = %plan.key().id, attempt = plan.retry.attempt);
                    self.settler.settle(Settlement {
                        record: AuditRecord::from_plan(rid, &plan, AuditOutcome::Success),
                        request_id: rid.to_string(),
                        usage: response.usage,
                        completion: response.completion.clone(),
                        audio_minutes: response.audio_minutes,
                        plan,
                        request: upstream_request,
                    });
                    return Ok(response);
                }
                Err(upstream) => {
                    match self
                        .on_failure(rid, plan, upstream_request, upstream.into())
                        .await
                    {
                        Flow::Continue {
                            args: next_args,
                            retry: next_retry,
                        } => {
                            args = next_args;
                            retry = next_retry;
                        }
                        Flow::Stop(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// 流式调用；上游流建立之前的错误按非流式规则重试，建立之后逐帧转发
    pub async fn execute_stream(
        &self,
        ctx: &RequestContext,
        request: &GatewayRequest,
    ) -> Result<mpsc::Receiver<StreamFrame>> {
        self.ensure_accepting(ctx)?;
        let rid = ctx.request_id.as_str();
        let mut args = ResolveArgs::default();
        let mut retry = RetryContext::new();

        loop {
            let (plan, upstream_request) = self.prepare(ctx, request, &args, &retry).await?;
            match self.adapter.stream(&plan, &upstream_request).await {
                Ok(upstream) => {
                    self.selector.record_success(plan.key(), plan.agent()).await;
                    ldebug!(rid, LogStage::Upstream, LogComponent::Gateway, "stream_open", "上游流已建立", real_model = %plan.real_model.model, key_id = %plan.key().id);
                    let (client, receiver) = mpsc::channel(STREAM_BUFFER);
                    tokio::spawn(relay(
                        rid.to_string(),
                        plan,
                        upstream_request,
                        upstream,
                        client,
                        self.selector.clone(),
                        self.settler.clone(),
                    ));
                    return Ok(receiver);
                }
                Err(upstream) => {
                    match self
                        .on_failure(rid, plan, upstream_request, upstream.into())
                        .await
                    {
                        Flow::Continue {
                            args: next_args,
                            retry: next_retry,
                        } => {
                            args = next_args;
                            retry = next_retry;
                        }
                        Flow::Stop(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// 停止接收请求，等待后台结算全部完成
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.settler.pool.shutdown().await;
    }

    fn ensure_accepting(&self, ctx: &RequestContext) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            return Ok(());
        }
        lwarn!(&ctx.request_id, LogStage::Shutdown, LogComponent::Gateway, "request_rejected", "网关已关闭，拒绝请求");
        Err(ProxyError::internal("网关已关闭"))
    }

    /// 解析计划并应用预设，解析失败直接审计后返回
    async fn prepare(
        &self,
        ctx: &RequestContext,
        request: &GatewayRequest,
        args: &ResolveArgs,
        retry: &RetryContext,
    ) -> Result<(DispatchPlan, GatewayRequest)> {
        let plan = match self.resolver.resolve(ctx, request, args, retry).await {
            Ok(plan) => plan,
            Err(err) => {
                lwarn!(&ctx.request_id, LogStage::Resolve, LogComponent::Gateway, "resolve_failed", "调度计划解析失败", error = %err);
                self.settler
                    .report(&ctx.request_id, AuditRecord::unresolved(ctx, &err));
                return Err(err);
            }
        };

        let mut upstream_request = request.clone();
        if let Some(preset) = &plan.preset {
            apply_preset(&mut upstream_request, preset);
        }
        Ok((plan, upstream_request))
    }

    async fn on_failure(
        &self,
        rid: &str,
        plan: DispatchPlan,
        request: GatewayRequest,
        err: ProxyError,
    ) -> Flow {
        let decision = self.failover.decide(rid, &plan, &err).await;
        if classify(&err).disable && plan.provider.auth.requires_exchange() {
            self.resolver.invalidate_credential(rid, plan.key()).await;
        }
        match decision {
            Decision::Retry { args, retry }
            | Decision::FallbackAgent { args, retry }
            | Decision::FallbackModel { args, retry } => Flow::Continue { args, retry },
            Decision::Aborted => {
                self.settler.settle(Settlement {
                    record: AuditRecord::from_plan(rid, &plan, AuditOutcome::Aborted)
                        .with_error(&err),
                    request_id: rid.to_string(),
                    usage: partial_usage(&err),
                    completion: String::new(),
                    audio_minutes: 0.0,
                    plan,
                    request,
                });
                Flow::Stop(err)
            }
            Decision::Fail => {
                lwarn!(rid, LogStage::Failover, LogComponent::Gateway, "request_failed", "请求失败", error = %err);
                self.settler.report(
                    rid,
                    AuditRecord::from_plan(rid, &plan, AuditOutcome::Failed).with_error(&err),
                );
                Flow::Stop(err)
            }
        }
    }
}

fn partial_usage(err: &ProxyError) -> Option<Usage> {
    match err.root() {
        ProxyError::Upstream(upstream) => upstream.partial_usage().copied(),
        _ => None,
    }
}

/// 转发上游流帧，累计回复与用量，流结束后结算
async fn relay(
    request_id: String,
    plan: DispatchPlan,
    request: GatewayRequest,
    mut upstream: mpsc::Receiver<StreamFrame>,
    client: mpsc::Sender<StreamFrame>,
    selector: Arc<dyn Selector>,
    settler: Settler,
) {
    let mut completion = String::new();
    let mut usage = None;
    let mut outcome = AuditOutcome::Success;
    let mut failure: Option<ProxyError> = None;

    while let Some(frame) = upstream.recv().await {
        match &frame {
            StreamFrame::Delta(text) => completion.push_str(text),
            StreamFrame::Usage(reported) => usage = Some(*reported),
            StreamFrame::Error(upstream_err) => {
                if usage.is_none() {
                    usage = upstream_err.partial_usage().copied();
                }
                let err = ProxyError::from(upstream_err.clone());
                if is_aborted(&err) {
                    outcome = AuditOutcome::Aborted;
                } else {
                    selector
                        .record_error(&plan.real_model, Some(plan.key()), plan.agent())
                        .await;
                    outcome = AuditOutcome::Failed;
                }
                failure = Some(err);
            }
        }

        let last = failure.is_some();
        if client.send(frame).await.is_err() {
            ldebug!(&request_id, LogStage::Upstream, LogComponent::Gateway, "client_gone", "客户端已断开，停止转发");
            if failure.is_none() {
                outcome = AuditOutcome::Aborted;
            }
            break;
        }
        if last {
            break;
        }
    }

    let mut record = AuditRecord::from_plan(&request_id, &plan, outcome);
    if let Some(err) = &failure {
        record = record.with_error(err);
    }
    settler.settle(Settlement {
        record,
        request_id,
        usage,
        completion,
        audio_minutes: 0.0,
        plan,
        request,
    });
}

/// 一次结算所需的数据，整体移入后台任务
struct Settlement {
    request_id: String,
    plan: DispatchPlan,
    request: GatewayRequest,
    usage: Option<Usage>,
    completion: String,
    audio_minutes: f64,
    record: AuditRecord,
}

#[derive(Clone)]
struct Settler {
    billing: Arc<BillingEngine>,
    ledger: Arc<QuotaLedger>,
    audit: Arc<dyn AuditSink>,
    pool: Arc<BackgroundPool>,
}

impl Settler {
    /// 计费、记账、审计
    fn settle(&self, settlement: Settlement) {
        let billing = self.billing.clone();
        let ledger = self.ledger.clone();
        let audit = self.audit.clone();
        let rid = settlement.request_id.clone();

        self.pool.dispatch(&rid, "settle", async move {
            let Settlement {
                request_id,
                plan,
                request,
                usage,
                completion,
                audio_minutes,
                record,
            } = settlement;
            let input = BillingInput::new(&request_id, &request)
                .with_usage(usage.as_ref())
                .with_completion(&completion)
                .with_audio_minutes(audio_minutes);
            let spend = billing.billing(&plan, &input, None);
            ledger
                .record_usage(&LedgerEntry::from_plan(&request_id, &plan, &spend))
                .await?;
            audit.record(record.with_spend(spend)).await
        });
    }

    /// 只写审计
    fn report(&self, request_id: &str, record: AuditRecord) {
        let audit = self.audit.clone();
        self.pool
            .dispatch(request_id, "audit", async move { audit.record(record).await });
    }
}
