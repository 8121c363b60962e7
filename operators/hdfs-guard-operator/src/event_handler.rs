//! 事件处理模块
//!
//! 该模块监听带有 `hdfs-guard.io/service` 与 `hdfs-guard.io/task-id`
//! 标签的 Pod，把 Pod 生命周期翻译成任务事件交给身份控制器：
//!
//! - Pod 进入 `Running` 时启动任务
//! - Pod 结束、被删除时停止任务，凭据保留
//! - 运行中的 Pod 换到其他节点时迁移任务
//! - 删除带有 `hdfs-guard.io/decommission=true` 注解的 Pod 时永久下线任务

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    client::Client,
    runtime::{watcher, watcher::Event},
    ResourceExt,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hdfs_guard_common::{TaskEvent, TaskIdentity};
use hdfs_guard_controller::IdentityController;

/// 服务名标签
pub const SERVICE_LABEL: &str = "hdfs-guard.io/service";

/// 任务 ID 标签
pub const TASK_LABEL: &str = "hdfs-guard.io/task-id";

/// 永久下线注解
pub const DECOMMISSION_ANNOTATION: &str = "hdfs-guard.io/decommission";

/// 监听器出错后的重试间隔
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pod 所承载任务的最近状态
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placement {
    task: TaskIdentity,
    node: Option<String>,
    running: bool,
}

/// Pod 状态跟踪器
///
/// 记录每个 Pod 上次观察到的任务、节点与运行状态，
/// 由前后两次观察的差异得出任务事件。
#[derive(Debug)]
pub struct PodTracker {
    service: String,
    pods: HashMap<String, Placement>,
}

impl PodTracker {
    /// 创建跟踪器，只关注指定服务的 Pod
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            pods: HashMap::new(),
        }
    }

    /// 正在跟踪的 Pod 数量
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// 是否没有跟踪任何 Pod
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// 处理一个监听事件
    pub fn handle(&mut self, event: Event<Pod>) -> Vec<TaskEvent> {
        match event {
            Event::Applied(pod) => self.applied(&pod),
            Event::Deleted(pod) => self.deleted(&pod).into_iter().collect(),
            Event::Restarted(pods) => self.restarted(&pods),
        }
    }

    /// Pod 被创建或修改
    pub fn applied(&mut self, pod: &Pod) -> Vec<TaskEvent> {
        let Some(task) = self.task_of(pod) else {
            return Vec::new();
        };
        let current = Placement {
            task: task.clone(),
            node: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
            running: is_running(pod),
        };
        let previous = self.pods.insert(pod.name_any(), current.clone());

        match previous {
            Some(previous) if previous.task != current.task => {
                warn!(
                    "Pod {} 的任务由 {} 变为 {}",
                    pod.name_any(),
                    previous.task,
                    current.task
                );
                let mut events = Vec::new();
                if previous.running {
                    events.push(TaskEvent::Stop(previous.task));
                }
                if current.running {
                    events.push(TaskEvent::Start(task));
                }
                events
            }
            Some(previous) if previous.running && current.running => {
                if previous.node != current.node {
                    info!(
                        "任务 {} 从节点 {:?} 迁移到 {:?}",
                        task, previous.node, current.node
                    );
                    vec![TaskEvent::Relocate(task)]
                } else {
                    Vec::new()
                }
            }
            Some(previous) if previous.running => vec![TaskEvent::Stop(task)],
            _ if current.running => vec![TaskEvent::Start(task)],
            _ => Vec::new(),
        }
    }

    /// Pod 被删除
    pub fn deleted(&mut self, pod: &Pod) -> Option<TaskEvent> {
        let previous = self.pods.remove(&pod.name_any());
        let task = match self.task_of(pod) {
            Some(task) => task,
            None => previous.as_ref().map(|p| p.task.clone())?,
        };

        if is_decommissioned(pod) {
            info!("Pod {} 带有下线注解，永久下线任务 {}", pod.name_any(), task);
            return Some(TaskEvent::Decommission(task));
        }

        match previous {
            Some(previous) if previous.running => Some(TaskEvent::Stop(task)),
            _ => None,
        }
    }

    /// 监听器重新列举全部 Pod
    ///
    /// 不在新列表中的已跟踪 Pod 视为已删除。
    pub fn restarted(&mut self, pods: &[Pod]) -> Vec<TaskEvent> {
        let listed: Vec<String> = pods.iter().map(|pod| pod.name_any()).collect();
        let vanished: Vec<(String, Placement)> = self
            .pods
            .iter()
            .filter(|(name, _)| !listed.contains(name))
            .map(|(name, placement)| (name.clone(), placement.clone()))
            .collect();

        let mut events = Vec::new();
        for (name, placement) in vanished {
            self.pods.remove(&name);
            if placement.running {
                events.push(TaskEvent::Stop(placement.task));
            }
        }
        for pod in pods {
            events.extend(self.applied(pod));
        }
        events
    }

    /// 由 Pod 标签得出任务身份
    fn task_of(&self, pod: &Pod) -> Option<TaskIdentity> {
        let labels = pod.labels();
        if labels.get(SERVICE_LABEL) != Some(&self.service) {
            return None;
        }
        let task_id = labels.get(TASK_LABEL)?;
        match TaskIdentity::parse(task_id, &self.service) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("忽略 Pod {}: {}", pod.name_any(), e);
                None
            }
        }
    }
}

/// Pod 是否处于运行状态
fn is_running(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

/// Pod 是否带有永久下线注解
fn is_decommissioned(pod: &Pod) -> bool {
    pod.annotations()
        .get(DECOMMISSION_ANNOTATION)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// 事件处理器
pub struct EventHandler {
    /// Kubernetes 客户端
    client: Client,
    /// 身份控制器
    controller: Arc<IdentityController>,
    /// 服务名
    service: String,
    /// 监听的命名空间，为空时监听所有命名空间
    namespace: Option<String>,
    /// 取消令牌
    cancel: CancellationToken,
}

impl EventHandler {
    /// 创建新的事件处理器
    pub fn new(
        client: Client,
        controller: Arc<IdentityController>,
        service: &str,
        namespace: Option<String>,
    ) -> Self {
        Self {
            client,
            controller,
            service: service.to_string(),
            namespace,
            cancel: CancellationToken::new(),
        }
    }

    /// 启动 Pod 监听器与事件处理循环
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let (event_tx, event_rx) = mpsc::channel(100);
        vec![
            self.start_pod_watcher(event_tx),
            self.start_event_processor(event_rx),
        ]
    }

    /// 停止事件处理器
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn start_pod_watcher(&self, event_tx: mpsc::Sender<TaskEvent>) -> JoinHandle<()> {
        let api: Api<Pod> = match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let selector = format!("{}={}", SERVICE_LABEL, self.service);
        let mut tracker = PodTracker::new(&self.service);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut stream = watcher(api, watcher::Config::default().labels(&selector)).boxed();
            info!("启动 Pod 监听器: {}", selector);

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        for task_event in tracker.handle(event) {
                            if event_tx.send(task_event).await.is_err() {
                                debug!("事件通道已关闭，Pod 监听器退出");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("Pod 监听器错误: {}", e);
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    }
                    None => {
                        warn!("Pod 监听流结束");
                        break;
                    }
                }
            }
            info!("Pod 监听器已停止");
        })
    }

    fn start_event_processor(&self, mut event_rx: mpsc::Receiver<TaskEvent>) -> JoinHandle<()> {
        let controller = self.controller.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                debug!("处理任务事件: {:?}", event);
                if let Err(e) = controller.handle_event(event.clone()).await {
                    error!("处理任务 {} 的事件失败: {}", event.task(), e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    use hdfs_guard_common::Role;

    fn pod(name: &str, task_id: &str, node: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([
                    (SERVICE_LABEL.to_string(), "hdfs".to_string()),
                    (TASK_LABEL.to_string(), task_id.to_string()),
                ])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            }),
        }
    }

    fn decommissioned(mut pod: Pod) -> Pod {
        pod.metadata.annotations = Some(BTreeMap::from([(
            DECOMMISSION_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        pod
    }

    fn name0() -> TaskIdentity {
        TaskIdentity::new("hdfs", Role::Name, 0)
    }

    #[test]
    fn test_pending_then_running_starts_once() {
        let mut tracker = PodTracker::new("hdfs");
        assert!(tracker.applied(&pod("nn-0", "name-0-node", "n1", "Pending")).is_empty());
        assert_eq!(
            tracker.applied(&pod("nn-0", "name-0-node", "n1", "Running")),
            vec![TaskEvent::Start(name0())]
        );
        assert!(tracker.applied(&pod("nn-0", "name-0-node", "n1", "Running")).is_empty());
    }

    #[test]
    fn test_node_change_is_relocation() {
        let mut tracker = PodTracker::new("hdfs");
        tracker.applied(&pod("nn-0", "name-0-node", "n1", "Running"));
        assert_eq!(
            tracker.applied(&pod("nn-0", "name-0-node", "n2", "Running")),
            vec![TaskEvent::Relocate(name0())]
        );
    }

    #[test]
    fn test_finished_pod_stops_task() {
        let mut tracker = PodTracker::new("hdfs");
        tracker.applied(&pod("nn-0", "name-0-node", "n1", "Running"));
        assert_eq!(
            tracker.applied(&pod("nn-0", "name-0-node", "n1", "Failed")),
            vec![TaskEvent::Stop(name0())]
        );
    }

    #[test]
    fn test_terminating_pod_stops_task() {
        let mut tracker = PodTracker::new("hdfs");
        tracker.applied(&pod("nn-0", "name-0-node", "n1", "Running"));

        let mut terminating = pod("nn-0", "name-0-node", "n1", "Running");
        terminating.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        assert_eq!(tracker.applied(&terminating), vec![TaskEvent::Stop(name0())]);
    }

    #[test]
    fn test_delete_stops_or_decommissions() {
        let mut tracker = PodTracker::new("hdfs");
        let running = pod("nn-0", "name-0-node", "n1", "Running");
        tracker.applied(&running);
        assert_eq!(tracker.deleted(&running), Some(TaskEvent::Stop(name0())));
        assert!(tracker.is_empty());

        tracker.applied(&running);
        assert_eq!(
            tracker.deleted(&decommissioned(running)),
            Some(TaskEvent::Decommission(name0()))
        );
    }

    #[test]
    fn test_decommission_of_untracked_pod() {
        let mut tracker = PodTracker::new("hdfs");
        let pod = decommissioned(pod("dn-4", "data-4-node", "n1", "Succeeded"));
        assert_eq!(
            tracker.deleted(&pod),
            Some(TaskEvent::Decommission(TaskIdentity::new("hdfs", Role::Data, 4)))
        );
    }

    #[test]
    fn test_foreign_and_malformed_pods_are_ignored() {
        let mut tracker = PodTracker::new("hdfs");

        let mut other = pod("x", "name-0-node", "n1", "Running");
        other
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(SERVICE_LABEL.to_string(), "hbase".to_string());
        assert!(tracker.applied(&other).is_empty());

        assert!(tracker.applied(&pod("y", "client-0-node", "n1", "Running")).is_empty());
        assert!(tracker.applied(&pod("z", "garbage", "n1", "Running")).is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_task_label_change_stops_previous_task() {
        let mut tracker = PodTracker::new("hdfs");
        tracker.applied(&pod("nn-0", "name-0-node", "n1", "Running"));

        let name1 = TaskIdentity::new("hdfs", Role::Name, 1);
        assert_eq!(
            tracker.applied(&pod("nn-0", "name-1-node", "n1", "Running")),
            vec![TaskEvent::Stop(name0()), TaskEvent::Start(name1.clone())]
        );
        assert_eq!(
            tracker.applied(&pod("nn-0", "name-0-node", "n1", "Pending")),
            vec![TaskEvent::Stop(name1)]
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_restart_reconciles_vanished_pods() {
        let mut tracker = PodTracker::new("hdfs");
        tracker.applied(&pod("nn-0", "name-0-node", "n1", "Running"));
        tracker.applied(&pod("dn-0", "data-0-node", "n1", "Running"));

        let events = tracker.handle(Event::Restarted(vec![
            pod("nn-0", "name-0-node", "n1", "Running"),
            pod("jn-0", "journal-0-node", "n3", "Running"),
        ]));

        assert_eq!(
            events,
            vec![
                TaskEvent::Stop(TaskIdentity::new("hdfs", Role::Data, 0)),
                TaskEvent::Start(TaskIdentity::new("hdfs", Role::Journal, 0)),
            ]
        );
        assert_eq!(tracker.len(), 2);
    }
}
