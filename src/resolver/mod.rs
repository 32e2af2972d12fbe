//! # 请求解析
//!
//! 把一次调用解析为具体的调度计划：确定分组与模型、处理转发规则、挑选代理与
//! 密钥、换取凭证并计算上游地址。选择失败时按请求模型的回退配置换代理或换模型，
//! 每一跳都是一次全新的解析。

mod forward;
mod plan;
mod preset;

use std::sync::Arc;

use chrono::Utc;

use crate::config::GatewayConfig;
use crate::credential::CredentialService;
use crate::error::{ProxyError, Result, SelectorError};
use crate::failover::{classify, is_max_retry};
use crate::logging::{LogComponent, LogStage};
use crate::registry::{App, AppKey, Group, Key, Model, ModelAgent, Provider, Registry, User};
use crate::selector::{Pick, Selector};
use crate::types::{AgentId, GatewayRequest, RequestContext};
use crate::{ensure_business, ldebug, linfo, lwarn};

pub use forward::should_forward;
pub use plan::{DispatchPlan, FallbackHop, ResolveArgs, RetryContext, Route};
pub use preset::apply_preset;

/// 调用方身份对应的注册表记录
#[derive(Debug, Clone)]
struct Tenant {
    user: User,
    app: App,
    app_key: AppKey,
}

/// 单次解析的结果
enum Pass {
    Plan(Box<DispatchPlan>),
    /// 代理或密钥选择失败，或凭证交换用尽重试预算，交给回退探测
    Exhausted {
        error: ProxyError,
        tried_agent: Option<AgentId>,
        /// 本次解析中更新过的重试上下文（新增的禁用组合）
        carried: Option<RetryContext>,
    },
    /// 凭证交换可重试地失败，用新的重试上下文再解析一次
    Retry(RetryContext),
}

/// 请求解析器
pub struct Resolver {
    registry: Arc<dyn Registry>,
    selector: Arc<dyn Selector>,
    credentials: Arc<CredentialService>,
    retry: i32,
}

impl Resolver {
    pub fn new(
        registry: Arc<dyn Registry>,
        selector: Arc<dyn Selector>,
        credentials: Arc<CredentialService>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            credentials,
            retry: config.retry,
        }
    }

    /// 解析出一份调度计划
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        request: &GatewayRequest,
        args: &ResolveArgs,
        retry: &RetryContext,
    ) -> Result<DispatchPlan> {
        let rid = ctx.request_id.as_str();
        let tenant = self.load_tenant(ctx).await?;
        let (group, req_model) = self.select_group_and_model(rid, &tenant, &request.model).await?;
        check_allow_lists(&tenant, &req_model)?;

        let mut args = args.clone();
        let mut retry = retry.clone();
        loop {
            let pass = self
                .resolve_pass(rid, request, &tenant, group.as_ref(), &req_model, &args, &retry)
                .await?;
            match pass {
                Pass::Plan(plan) => {
                    linfo!(rid, LogStage::Resolve, LogComponent::Resolver, "plan_resolved", "调度计划已生成", req_model = %plan.req_model.id, real_model = %plan.real_model.model, key_id = %plan.key().id, agent_id = ?plan.agent().map(|a| a.id.as_str()), attempt = plan.retry.attempt);
                    return Ok(*plan);
                }
                Pass::Retry(next) => retry = next,
                Pass::Exhausted {
                    error,
                    tried_agent,
                    carried,
                } => {
                    if let Some(carried) = carried {
                        retry = carried;
                    }
                    let Some(hop) = args.next_hop(&req_model, tried_agent.as_deref()) else {
                        return Err(error);
                    };
                    lwarn!(rid, LogStage::Resolve, LogComponent::Resolver, "fallback_hop", "选择失败，进入回退", error = %error, hop = ?hop);
                    retry = retry.fallback(error.to_string());
                    args = hop.into_args();
                }
            }
        }
    }

    async fn load_tenant(&self, ctx: &RequestContext) -> Result<Tenant> {
        let user = self
            .registry
            .user(&ctx.user_id)
            .await?
            .ok_or_else(|| ProxyError::business(format!("用户 {} 不存在", ctx.user_id)))?;
        ensure_business!(user.status.is_enabled(), "用户 {} 已禁用", user.id);

        let app = self
            .registry
            .app(&ctx.app_id)
            .await?
            .ok_or_else(|| ProxyError::business(format!("应用 {} 不存在", ctx.app_id)))?;
        ensure_business!(app.status.is_enabled(), "应用 {} 已禁用", app.id);
        ensure_business!(app.user_id == user.id, "应用 {} 不属于用户 {}", app.id, user.id);

        let app_key = self
            .registry
            .app_key(&ctx.app_key)
            .await?
            .ok_or_else(|| ProxyError::business("应用密钥不存在"))?;
        ensure_business!(app_key.status.is_enabled(), "应用密钥已禁用");
        ensure_business!(app_key.app_id == app.id, "应用密钥不属于应用 {}", app.id);

        Ok(Tenant { user, app, app_key })
    }

    /// 确定生效分组与请求模型
    async fn select_group_and_model(
        &self,
        rid: &str,
        tenant: &Tenant,
        name: &str,
    ) -> Result<(Option<Group>, Model)> {
        let binding = tenant.app_key.group.as_ref().or(tenant.app.group.as_ref());
        if let Some(group_id) = binding {
            let group = self
                .registry
                .group(group_id)
                .await?
                .ok_or_else(|| ProxyError::group_not_found(group_id.clone()))?;
            check_group_state(&group)?;
            if let Some(model) = self.group_model(&group, name).await? {
                return Ok((Some(group), model));
            }
            if !group.is_default {
                return Err(ProxyError::model_not_found(name));
            }
            ldebug!(rid, LogStage::Resolve, LogComponent::Resolver, "default_group_degrade", "默认分组未提供该模型，按无分组解析", group_id = %group.id, model = name);
            return Ok((None, self.ungrouped_model(&tenant.user, name).await?));
        }

        let mut default_in_play = false;
        for group_id in &tenant.user.groups {
            let Some(group) = self.registry.group(group_id).await? else {
                continue;
            };
            default_in_play |= group.is_default;
            if let Some(model) = self.group_model(&group, name).await? {
                check_group_state(&group)?;
                return Ok((Some(group), model));
            }
        }

        if !tenant.user.groups.is_empty() && !default_in_play {
            return Err(ProxyError::model_not_found(name));
        }
        Ok((None, self.ungrouped_model(&tenant.user, name).await?))
    }

    /// 分组中对外名称为 `name` 的启用模型
    async fn group_model(&self, group: &Group, name: &str) -> Result<Option<Model>> {
        for model_id in &group.models {
            if let Some(model) = self.registry.model(model_id).await? {
                if model.status.is_enabled() && model.name == name {
                    return Ok(Some(model));
                }
            }
        }
        Ok(None)
    }

    async fn ungrouped_model(&self, user: &User, name: &str) -> Result<Model> {
        self.registry
            .models_by_name(name)
            .await?
            .into_iter()
            .filter(|model| model.status.is_enabled())
            .find(|model| user.models.is_empty() || user.models.contains(&model.id))
            .ok_or_else(|| ProxyError::model_not_found(name))
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_pass(
        &self,
        rid: &str,
        request: &GatewayRequest,
        tenant: &Tenant,
        group: Option<&Group>,
        req_model: &Model,
        args: &ResolveArgs,
        retry: &RetryContext,
    ) -> Result<Pass> {
        let mut real_model = match &args.fallback_model {
            Some(model_id) => self
                .registry
                .model(model_id)
                .await?
                .filter(|model| model.status.is_enabled())
                .ok_or_else(|| ProxyError::model_not_found(model_id.clone()))?,
            None => req_model.clone(),
        };

        if args.fallback_model.is_none() {
            if let Some(target) = self.forward_target(rid, group, req_model, request).await? {
                real_model = target;
            }
        }

        let agent_pick = match self.pick_agent(group, &real_model, args).await {
            Ok(pick) => pick,
            Err(SelectorError::Registry(err)) => return Err(*err),
            Err(err) => {
                lwarn!(rid, LogStage::Scheduling, LogComponent::Resolver, "pick_agent_failed", "没有可用的模型代理", error = %err);
                return Ok(Pass::Exhausted {
                    error: ProxyError::no_available_agent(req_model.name.clone()),
                    tried_agent: None,
                    carried: None,
                });
            }
        };

        let agent_pool_size = agent_pick.as_ref().map_or(0, |pick| pick.pool_size);
        let (route, key_pool_size) = match agent_pick {
            Some(Pick { item: agent, .. }) => match self.selector.pick_agent_key(&agent).await {
                Ok(pick) => (
                    Route::Agent {
                        agent,
                        key: pick.item,
                    },
                    pick.pool_size,
                ),
                Err(SelectorError::Registry(err)) => return Err(*err),
                Err(err) => {
                    self.selector.record_error(&real_model, None, Some(&agent)).await;
                    if err.agent_exhausted() {
                        self.selector.disable_agent(&agent, "没有可用的密钥").await;
                    }
                    return Ok(Pass::Exhausted {
                        error: ProxyError::no_available_key(req_model.name.clone()),
                        tried_agent: Some(agent.id),
                        carried: None,
                    });
                }
            },
            None => match self.selector.pick_key(&real_model).await {
                Ok(pick) => (Route::Direct { key: pick.item }, pick.pool_size),
                Err(SelectorError::Registry(err)) => return Err(*err),
                Err(err) => {
                    lwarn!(rid, LogStage::Scheduling, LogComponent::Resolver, "pick_key_failed", "没有可用的密钥", error = %err);
                    return Ok(Pass::Exhausted {
                        error: ProxyError::no_available_key(req_model.name.clone()),
                        tried_agent: None,
                        carried: None,
                    });
                }
            },
        };

        let agent_id = route.agent().map(|agent| agent.id.clone());
        if retry.is_disabled(agent_id.as_deref(), &route.key().id) {
            ldebug!(rid, LogStage::Scheduling, LogComponent::Resolver, "disabled_pair", "选中的代理与密钥已在本请求中禁用", key_id = %route.key().id, agent_id = ?agent_id);
            return Ok(Pass::Exhausted {
                error: ProxyError::no_available_key(req_model.name.clone()),
                tried_agent: agent_id,
                carried: None,
            });
        }

        if let Some(agent) = route.agent() {
            if let Some(replacement) = agent.replace_model(&real_model.model) {
                real_model.model = replacement.to_string();
            }
        }

        let provider_id = route
            .agent()
            .map_or(real_model.provider_id.as_str(), |agent| agent.provider_id.as_str());
        let provider = self
            .registry
            .provider(provider_id)
            .await?
            .ok_or_else(|| ProxyError::registry(format!("提供商 {provider_id} 不存在")))?;

        let credential = match self.credentials.credential(rid, &provider, route.key()).await {
            Ok(credential) => credential,
            Err(err) => {
                return self
                    .credential_failure(
                        rid,
                        err,
                        &real_model,
                        &route,
                        agent_pool_size,
                        key_pool_size,
                        retry,
                    )
                    .await;
            }
        };

        let (base_url, path) = endpoint(route.agent(), &real_model, &provider);
        let preset = real_model
            .preset_config
            .clone()
            .filter(|_| real_model.is_enable_preset_config);

        Ok(Pass::Plan(Box::new(DispatchPlan {
            req_model: req_model.clone(),
            real_model,
            route,
            provider,
            base_url,
            path,
            credential,
            user: tenant.user.clone(),
            app: tenant.app.clone(),
            app_key: tenant.app_key.clone(),
            group: group.cloned(),
            agent_pool_size,
            key_pool_size,
            args: args.clone(),
            retry: retry.clone(),
            preset,
        })))
    }

    /// 转发目标：分组规则优先，其次模型规则
    async fn forward_target(
        &self,
        rid: &str,
        group: Option<&Group>,
        req_model: &Model,
        request: &GatewayRequest,
    ) -> Result<Option<Model>> {
        let group_rule = group
            .filter(|group| group.is_enable_forward)
            .and_then(|group| group.forward_config.as_ref());
        let model_rule = req_model
            .forward_config
            .as_ref()
            .filter(|_| req_model.is_enable_forward);

        let Some(rule) = [group_rule, model_rule]
            .into_iter()
            .flatten()
            .find(|rule| should_forward(rule, request))
        else {
            return Ok(None);
        };

        let target = self
            .registry
            .model(&rule.target_model)
            .await?
            .filter(|model| model.status.is_enabled())
            .ok_or_else(|| ProxyError::model_not_found(rule.target_model.clone()))?;
        ldebug!(rid, LogStage::Resolve, LogComponent::Resolver, "forward", "请求命中转发规则", from = %req_model.id, to = %target.id);
        Ok(Some(target))
    }

    async fn pick_agent(
        &self,
        group: Option<&Group>,
        real_model: &Model,
        args: &ResolveArgs,
    ) -> std::result::Result<Option<Pick<ModelAgent>>, SelectorError> {
        if let Some(group) =
            group.filter(|g| g.is_enable_model_agent && !g.model_agents.is_empty())
        {
            return self.selector.pick_group_agent(group, real_model).await.map(Some);
        }
        if let Some(agent_id) = &args.fallback_agent {
            let agent = self
                .registry
                .model_agent(agent_id)
                .await?
                .filter(|agent| agent.status.is_enabled())
                .ok_or_else(|| SelectorError::NoAvailableAgent {
                    model: real_model.id.clone(),
                })?;
            return Ok(Some(Pick::new(1, agent)));
        }
        if real_model.is_enable_model_agent {
            return self.selector.pick_agent(real_model).await.map(Some);
        }
        Ok(None)
    }

    /// 丢弃密钥的缓存令牌；失败只记录日志
    pub async fn invalidate_credential(&self, rid: &str, key: &Key) {
        if let Err(e) = self.credentials.invalidate(key).await {
            lwarn!(rid, LogStage::Credential, LogComponent::Resolver, "invalidate_failed", "清除缓存令牌失败", key_id = %key.id, error = %e);
        }
    }

    /// 凭证交换失败按上游错误分类
    ///
    /// 可重试且预算未用尽时返回新的重试上下文，预算用尽时交给回退探测。
    #[allow(clippy::too_many_arguments)]
    async fn credential_failure(
        &self,
        rid: &str,
        err: ProxyError,
        real_model: &Model,
        route: &Route,
        agent_pool_size: usize,
        key_pool_size: usize,
        retry: &RetryContext,
    ) -> Result<Pass> {
        let classification = classify(&err);
        if !classification.retry {
            return Err(err);
        }

        let key = route.key();
        let agent = route.agent();
        self.selector.record_error(real_model, Some(key), agent).await;
        let mut next = retry.clone();
        if classification.disable {
            self.selector.disable_key(key, &err.to_string()).await;
            self.invalidate_credential(rid, key).await;
            next.disable(agent.map(|a| a.id.as_str()), &key.id);
        }

        if is_max_retry(
            self.retry,
            route.is_agent_routing(),
            agent_pool_size,
            key_pool_size,
            retry.attempt,
        ) {
            lwarn!(rid, LogStage::Credential, LogComponent::Resolver, "credential_exhausted", "凭证交换重试用尽，进入回退", key_id = %key.id, error = %err);
            return Ok(Pass::Exhausted {
                error: err,
                tried_agent: agent.map(|a| a.id.clone()),
                carried: Some(next),
            });
        }
        lwarn!(rid, LogStage::Credential, LogComponent::Resolver, "credential_retry", "凭证交换失败，重新解析", key_id = %key.id, disable = classification.disable, error = %err);
        Ok(Pass::Retry(next.next_attempt(err.to_string())))
    }
}

fn check_group_state(group: &Group) -> Result<()> {
    if !group.status.is_enabled() {
        return Err(ProxyError::group_disabled(group.id.clone()));
    }
    if group.is_expired(Utc::now()) {
        return Err(ProxyError::group_expired(group.id.clone()));
    }
    if group.is_limit_quota && group.quota <= 0 {
        return Err(ProxyError::group_insufficient_quota(group.id.clone()));
    }
    Ok(())
}

fn check_allow_lists(tenant: &Tenant, model: &Model) -> Result<()> {
    let allowed = |models: &[String]| models.is_empty() || models.contains(&model.id);
    if !allowed(&tenant.app.models) || !allowed(&tenant.app_key.models) {
        return Err(ProxyError::model_not_found(model.name.clone()));
    }
    Ok(())
}

/// 上游地址：代理覆盖优先，其次模型，最后提供商；未配置路径时按模型类型取默认路径
fn endpoint(agent: Option<&ModelAgent>, model: &Model, provider: &Provider) -> (String, String) {
    let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());

    let base_url = agent
        .and_then(|agent| non_empty(&agent.base_url))
        .or_else(|| non_empty(&model.base_url))
        .unwrap_or_else(|| provider.base_url.clone());
    let path = agent
        .and_then(|agent| non_empty(&agent.path))
        .or_else(|| non_empty(&model.path))
        .or_else(|| non_empty(&provider.path))
        .unwrap_or_else(|| model.model_type.default_path().to_string());
    (base_url, path)
}
