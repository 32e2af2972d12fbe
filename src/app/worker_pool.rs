//! # 后台任务池
//!
//! 计费、记账与审计在请求返回后执行。任务经有界队列交给固定数量的工作者，
//! 每个任务单独 spawn 并等待结果，与请求自身的取消相互独立。
//! 任务返回错误或 panic 时交给致命钩子处理，默认记录日志后终止进程。
//! `dispatch` 的入队过程本身也在独立任务里完成，入队失败同样交给致命钩子。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use async_channel::{Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo};

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// 致命故障详情
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalEvent {
    pub request_id: String,
    pub job: String,
    pub reason: String,
}

pub type FatalHook = Arc<dyn Fn(FatalEvent) + Send + Sync>;

struct Job {
    request_id: String,
    name: String,
    future: JobFuture,
}

/// 默认致命钩子：记录后终止进程
pub fn abort_on_fatal() -> FatalHook {
    Arc::new(|event: FatalEvent| {
        lerror!(
            &event.request_id,
            LogStage::BackgroundTask,
            LogComponent::WorkerPool,
            "fatal_job",
            "后台任务失败，进程终止",
            job = %event.job,
            reason = %event.reason,
        );
        std::process::abort();
    })
}

/// 有界后台任务池
pub struct BackgroundPool {
    sender: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    hook: FatalHook,
    /// 尚未入队的移交任务；关闭后为 None
    handoffs: StdMutex<Option<JoinSet<()>>>,
}

impl BackgroundPool {
    /// 按网关配置创建，使用默认致命钩子
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_fatal_hook(config.worker_count, config.queue_capacity, abort_on_fatal())
    }

    pub fn with_fatal_hook(worker_count: usize, queue_capacity: usize, hook: FatalHook) -> Self {
        let (sender, receiver) = async_channel::bounded(queue_capacity.max(1));
        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(worker_id, receiver.clone(), hook.clone()))
            })
            .collect();

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::WorkerPool,
            "pool_started",
            "后台任务池已启动",
            workers = worker_count.max(1),
            capacity = queue_capacity.max(1),
        );

        Self {
            sender,
            workers: Mutex::new(workers),
            hook,
            handoffs: StdMutex::new(Some(JoinSet::new())),
        }
    }

    /// 提交任务，队列满时等待
    pub async fn submit<F>(&self, request_id: &str, name: &str, future: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let job = Job {
            request_id: request_id.to_string(),
            name: name.to_string(),
            future: Box::pin(future),
        };
        self.sender
            .send(job)
            .await
            .map_err(|_| ProxyError::internal(format!("后台任务池已关闭，任务 {name} 被丢弃")))
    }

    /// 立即返回，入队在独立任务中完成，调用方被取消不影响任务
    ///
    /// 池已关闭或入队失败时触发致命钩子。
    pub fn dispatch<F>(&self, request_id: &str, name: &str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let job = Job {
            request_id: request_id.to_string(),
            name: name.to_string(),
            future: Box::pin(future),
        };

        let mut guard = match self.handoffs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rejected = match guard.as_mut() {
            Some(handoffs) => {
                while handoffs.try_join_next().is_some() {}
                let sender = self.sender.clone();
                let hook = self.hook.clone();
                handoffs.spawn(async move {
                    if let Err(async_channel::SendError(job)) = sender.send(job).await {
                        hook(FatalEvent {
                            request_id: job.request_id,
                            job: job.name,
                            reason: "后台任务池已关闭".to_string(),
                        });
                    }
                });
                None
            }
            None => Some(job),
        };
        drop(guard);

        if let Some(job) = rejected {
            self.reject(job.request_id, job.name, "后台任务池已关闭".to_string());
        }
    }

    fn reject(&self, request_id: String, job: String, reason: String) {
        lerror!(&request_id, LogStage::BackgroundTask, LogComponent::WorkerPool, "job_rejected", "后台任务无法入队", job = %job, reason = %reason);
        (self.hook)(FatalEvent {
            request_id,
            job,
            reason,
        });
    }

    /// 排队中的任务数
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// 停止接收新任务，等待移交中的任务入队，再关闭队列并等待执行完
    pub async fn shutdown(&self) {
        let pending = match self.handoffs.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut handoffs) = pending {
            while handoffs.join_next().await.is_some() {}
        }
        self.sender.close();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                lerror!("system", LogStage::Shutdown, LogComponent::WorkerPool, "worker_join", "工作者退出异常", error = %e);
            }
        }
        linfo!("system", LogStage::Shutdown, LogComponent::WorkerPool, "pool_stopped", "后台任务池已停止");
    }
}

async fn run_worker(worker_id: usize, receiver: Receiver<Job>, hook: FatalHook) {
    while let Ok(job) = receiver.recv().await {
        let Job {
            request_id,
            name,
            future,
        } = job;
        ldebug!(&request_id, LogStage::BackgroundTask, LogComponent::WorkerPool, "job_start", "开始执行后台任务", job = %name, worker = worker_id);

        let reason = match tokio::spawn(future).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => format!("任务 panic: {e}"),
            Err(e) => format!("任务被取消: {e}"),
        };
        hook(FatalEvent {
            request_id,
            job: name,
            reason,
        });
    }
}
