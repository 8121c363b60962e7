//! 身份控制器
//!
//! 将主体注册表、凭据供应器、证书签发器、绑定器与映射解析器连接起来：
//! 接受拓扑变更并供应新增主体，按调度器的任务事件为每个任务运行
//! 独立的绑定状态机，并把证书轮换推送给已就绪的任务。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hdfs_guard_common::{Error, Principal, Result, ServiceTopology, TaskEvent, TaskIdentity};

use crate::identity::{
    BinderConfig, BindingLedger, BindingState, CertificateIssuer, CredentialProvisioner,
    IdentityBinder, PrincipalDiff, PrincipalRegistry,
};
use crate::mapping::{AuthMappingResolver, MappingRuleSpec};
use crate::metrics::GuardMetrics;

/// 正在运行的任务
struct TaskHandle {
    binder: Arc<IdentityBinder>,
    cancel: CancellationToken,
    join: JoinHandle<Result<()>>,
}

/// 身份控制器
pub struct IdentityController {
    /// 当前生效的拓扑
    topology: RwLock<Option<ServiceTopology>>,
    /// 当前拓扑的全部主体
    principals: RwLock<BTreeSet<Principal>>,
    provisioner: Arc<CredentialProvisioner>,
    issuer: Arc<CertificateIssuer>,
    resolver: Arc<AuthMappingResolver>,
    ledger: BindingLedger,
    binder_config: BinderConfig,
    metrics: Arc<GuardMetrics>,
    /// 按任务 ID 索引
    tasks: Mutex<HashMap<String, TaskHandle>>,
    /// 串行化拓扑变更
    apply_lock: Mutex<()>,
    /// 后台任务的取消令牌
    cancel: CancellationToken,
}

impl IdentityController {
    /// 创建控制器
    pub fn new(
        provisioner: Arc<CredentialProvisioner>,
        issuer: Arc<CertificateIssuer>,
        resolver: Arc<AuthMappingResolver>,
        binder_config: BinderConfig,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            topology: RwLock::new(None),
            principals: RwLock::new(BTreeSet::new()),
            provisioner,
            issuer,
            resolver,
            ledger: BindingLedger::new(),
            binder_config,
            metrics,
            tasks: Mutex::new(HashMap::new()),
            apply_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn provisioner(&self) -> &Arc<CredentialProvisioner> {
        &self.provisioner
    }

    pub fn issuer(&self) -> &Arc<CertificateIssuer> {
        &self.issuer
    }

    pub fn resolver(&self) -> &Arc<AuthMappingResolver> {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<GuardMetrics> {
        &self.metrics
    }

    /// 当前拓扑
    pub async fn topology(&self) -> Option<ServiceTopology> {
        self.topology.read().await.clone()
    }

    /// 当前拓扑的全部主体
    pub async fn principals(&self) -> BTreeSet<Principal> {
        self.principals.read().await.clone()
    }

    /// 启动证书检查与轮换推送任务
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let reissue = self.issuer.start_reissue_task(self.cancel.child_token());

        let controller = self.clone();
        let mut rotations = self.issuer.subscribe();
        let cancel = self.cancel.child_token();
        let push = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rotations.recv() => event,
                };
                match event {
                    Ok(rotated) => controller.adopt_rotation(&rotated.dns_name).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("丢失了 {} 个证书轮换事件，刷新全部任务", skipped);
                        controller.adopt_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("证书轮换推送任务退出");
        });

        info!("身份控制器已启动");
        vec![reissue, push]
    }

    async fn adopt_rotation(&self, dns_name: &str) {
        let binder = {
            let tasks = self.tasks.lock().await;
            tasks
                .values()
                .find(|handle| handle.binder.task().dns_name() == dns_name)
                .map(|handle| handle.binder.clone())
        };
        if let Some(binder) = binder {
            if let Err(e) = binder.refresh_certificate().await {
                error!("任务 {} 采用新证书失败: {}", binder.task(), e);
            }
        }
    }

    async fn adopt_all(&self) {
        let binders: Vec<Arc<IdentityBinder>> = {
            let tasks = self.tasks.lock().await;
            tasks.values().map(|handle| handle.binder.clone()).collect()
        };
        for binder in binders {
            if let Err(e) = binder.refresh_certificate().await {
                error!("任务 {} 采用新证书失败: {}", binder.task(), e);
            }
        }
    }

    /// 应用新拓扑
    ///
    /// 存在未映射主体时拒绝；接受后为新增主体供应凭据，下线缩容移除的任务，
    /// 吊销其余被移除的主体并重新绑定受影响的任务。
    pub async fn apply_topology(&self, topology: ServiceTopology) -> Result<PrincipalDiff> {
        let _apply = self.apply_lock.lock().await;
        let principals = PrincipalRegistry::derive(&topology)?;

        let unmapped = self.resolver.unmapped(&principals);
        if !unmapped.is_empty() {
            let names: Vec<String> = unmapped.iter().map(Principal::name).collect();
            return Err(Error::InvalidTopology(format!(
                "以下主体没有匹配的映射规则: {}",
                names.join(", ")
            )));
        }

        let previous = self.topology.read().await.clone();
        let diff = match &previous {
            Some(old) => PrincipalRegistry::diff(old, &topology)?,
            None => PrincipalDiff {
                added: principals.clone(),
                removed: BTreeSet::new(),
            },
        };

        for (principal, result) in self.provisioner.provision_all(&diff.added).await {
            match result {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    warn!("供应 {} 失败，任务启动时重试: {}", principal, e);
                }
                Err(e) => {
                    error!("供应 {} 失败: {}", principal, e);
                    return Err(e);
                }
            }
        }

        let removed_tasks: Vec<TaskIdentity> = previous
            .as_ref()
            .map(|old| {
                old.tasks()
                    .into_iter()
                    .filter(|task| !topology.contains_task(task))
                    .collect()
            })
            .unwrap_or_default();
        let remaining_tasks = topology.tasks();

        info!(
            "应用拓扑 {}: 新增 {} 个主体, 移除 {} 个主体",
            topology.name,
            diff.added.len(),
            diff.removed.len()
        );
        *self.topology.write().await = Some(topology);
        *self.principals.write().await = principals;

        for task in &removed_tasks {
            let principals: Vec<Principal> = diff
                .removed
                .iter()
                .filter(|p| p.belongs_to(task))
                .cloned()
                .collect();
            self.retire(task, &principals).await?;
        }

        // 客户端主体，以及任务仍在但 primary 被移除的服务主体
        let mut affected = BTreeSet::new();
        for principal in diff
            .removed
            .iter()
            .filter(|p| !removed_tasks.iter().any(|task| p.belongs_to(task)))
        {
            self.provisioner.revoke(principal).await?;
            if let Some(task_id) = principal.task_id() {
                affected.insert(task_id.to_string());
            }
        }
        for task in remaining_tasks
            .into_iter()
            .filter(|task| affected.contains(&task.task_id))
        {
            if self.tasks.lock().await.contains_key(&task.task_id) {
                info!("任务 {} 的主体集合已变化，重新绑定", task);
                self.stop_task(&task).await;
                self.start_task(task).await?;
            }
        }
        Ok(diff)
    }

    /// 替换映射规则，新规则必须覆盖当前拓扑的全部主体
    pub async fn replace_rules(&self, specs: &[MappingRuleSpec]) -> Result<()> {
        let principals = self.principals.read().await;
        self.resolver.replace_rules(specs, &principals)
    }

    /// 处理调度器的任务事件
    pub async fn handle_event(&self, event: TaskEvent) -> Result<()> {
        debug!("任务事件: {:?}", event);
        match event {
            TaskEvent::Start(task) => self.start_task(task).await,
            TaskEvent::Stop(task) => {
                self.stop_task(&task).await;
                Ok(())
            }
            TaskEvent::Relocate(task) => {
                self.stop_task(&task).await;
                self.start_task(task).await
            }
            TaskEvent::Decommission(task) => self.decommission(&task).await,
        }
    }

    async fn start_task(&self, task: TaskIdentity) -> Result<()> {
        let principals = {
            let topology = self.topology.read().await;
            let topology = topology
                .as_ref()
                .ok_or_else(|| Error::InvalidTopology("尚未应用拓扑".to_string()))?;
            if !topology.contains_task(&task) {
                return Err(Error::InvalidTopology(format!(
                    "任务 {} 不属于服务 {}",
                    task, topology.name
                )));
            }
            PrincipalRegistry::principals_for_task(topology, &task)
        };

        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.get(&task.task_id) {
            if !handle.join.is_finished() || handle.binder.state().is_ready() {
                debug!("任务 {} 已在运行", task);
                return Ok(());
            }
        }
        // 上一次绑定已失败或已结束，替换为新的绑定
        if let Some(stale) = tasks.remove(&task.task_id) {
            stale.binder.release().await;
        }

        let binder = Arc::new(IdentityBinder::new(
            task.clone(),
            principals,
            self.provisioner.clone(),
            self.issuer.clone(),
            self.ledger.clone(),
            self.binder_config.clone(),
            self.metrics.clone(),
        ));
        let cancel = self.cancel.child_token();
        let runner = binder.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { runner.run(token).await });

        info!("开始绑定任务 {}", task);
        tasks.insert(
            task.task_id.clone(),
            TaskHandle {
                binder,
                cancel,
                join,
            },
        );
        Ok(())
    }

    /// 停止任务：取消进行中的绑定并释放运行时材料，凭据保留
    async fn stop_task(&self, task: &TaskIdentity) {
        let handle = self.tasks.lock().await.remove(&task.task_id);
        let Some(handle) = handle else {
            debug!("任务 {} 没有运行中的绑定", task);
            return;
        };

        handle.cancel.cancel();
        match handle.join.await {
            Ok(Ok(())) | Ok(Err(Error::Cancelled)) => {}
            Ok(Err(e)) => debug!("任务 {} 的绑定以错误结束: {}", task, e),
            Err(e) => warn!("任务 {} 的绑定任务异常退出: {}", task, e),
        }
        handle.binder.release().await;
        info!("任务 {} 已停止", task);
    }

    /// 永久下线仍在拓扑中的任务
    async fn decommission(&self, task: &TaskIdentity) -> Result<()> {
        let principals = match self.topology.read().await.as_ref() {
            Some(topology) if topology.contains_task(task) => {
                PrincipalRegistry::principals_for_task(topology, task)
            }
            _ => Vec::new(),
        };
        self.retire(task, &principals).await
    }

    /// 停止绑定，撤销任务的主体并移除证书
    async fn retire(&self, task: &TaskIdentity, principals: &[Principal]) -> Result<()> {
        self.stop_task(task).await;
        for principal in principals {
            self.provisioner.revoke(principal).await?;
        }
        self.issuer.forget(&task.dns_name()).await;
        info!("任务 {} 已下线，撤销 {} 个主体", task, principals.len());
        Ok(())
    }

    /// 任务的绑定状态
    pub async fn state(&self, task_id: &str) -> Option<BindingState> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|handle| handle.binder.state())
    }

    /// 所有已知任务的绑定状态
    pub async fn states(&self) -> BTreeMap<String, BindingState> {
        self.tasks
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.binder.state()))
            .collect()
    }

    /// 订阅任务的状态变化
    pub async fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<BindingState>> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|handle| handle.binder.subscribe())
    }

    /// 任务的绑定器
    pub async fn binder(&self, task_id: &str) -> Option<Arc<IdentityBinder>> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|handle| handle.binder.clone())
    }

    /// 是否所有已知任务都处于 Ready
    pub async fn all_ready(&self) -> bool {
        let tasks = self.tasks.lock().await;
        !tasks.is_empty() && tasks.values().all(|handle| handle.binder.state().is_ready())
    }

    /// 等待任务进入 Ready 或 Unschedulable
    pub async fn wait_settled(&self, task_id: &str, timeout: Duration) -> Result<BindingState> {
        let mut states = self
            .subscribe(task_id)
            .await
            .ok_or_else(|| Error::NotReady(task_id.to_string()))?;
        let settled = tokio::time::timeout(timeout, states.wait_for(BindingState::is_terminal))
            .await
            .map_err(|_| Error::Timeout(format!("等待任务 {} 就绪", task_id)))?
            .map_err(|_| Error::NotReady(task_id.to_string()))?
            .clone();
        Ok(settled)
    }

    /// 停止所有任务与后台任务
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for id in ids {
            let binder = self.binder(&id).await;
            if let Some(binder) = binder {
                let task = binder.task().clone();
                self.stop_task(&task).await;
            }
        }
        info!("身份控制器已关闭");
    }
}
