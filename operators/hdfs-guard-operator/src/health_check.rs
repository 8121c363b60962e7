//! 健康检查模块
//!
//! 提供 Kubernetes 探针与 Prometheus 抓取使用的 HTTP 接口：
//!
//! - `/health`：各任务绑定状态的 JSON 摘要
//! - `/ready`：所有已知任务都处于 `Ready` 时返回 200，否则返回 503
//! - `/metrics`：Prometheus 文本格式指标

use anyhow::{Context, Result};
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hdfs_guard_controller::{BindingState, IdentityController};

use crate::config::HealthConfig;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// 所有任务就绪
    Healthy,
    /// 部分任务未就绪
    Degraded,
    /// 有任务无法调度，需要人工介入
    Unhealthy,
}

/// 健康检查结果
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// 健康状态
    pub status: HealthStatus,
    /// 检查时间
    pub checked_at: String,
    /// 当前拓扑的主体数
    pub principals: usize,
    /// 各任务的绑定状态
    pub tasks: BTreeMap<String, BindingState>,
}

impl HealthReport {
    /// 汇总控制器状态
    pub async fn collect(controller: &IdentityController) -> Self {
        let tasks = controller.states().await;
        let status = if tasks
            .values()
            .any(|state| matches!(state, BindingState::Unschedulable { .. }))
        {
            HealthStatus::Unhealthy
        } else if tasks.values().all(BindingState::is_ready) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            checked_at: k8s_openapi::chrono::Utc::now().to_rfc3339(),
            principals: controller.principals().await.len(),
            tasks,
        }
    }
}

/// 健康检查服务器
pub struct HealthServer {
    controller: Arc<IdentityController>,
    addr: SocketAddr,
}

impl HealthServer {
    /// 按配置创建服务器
    pub fn new(controller: Arc<IdentityController>, config: &HealthConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.listen_address, config.port)
            .parse()
            .with_context(|| {
                format!(
                    "无效的健康检查地址: {}:{}",
                    config.listen_address, config.port
                )
            })?;
        Ok(Self { controller, addr })
    }

    /// 监听地址
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 提供服务直到被取消
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let controller = self.controller.clone();
        let make_svc = make_service_fn(move |_| {
            let controller = controller.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let controller = controller.clone();
                    async move { Ok::<_, Infallible>(route(&controller, req).await) }
                }))
            }
        });

        let server = Server::try_bind(&self.addr)
            .with_context(|| format!("无法绑定健康检查地址 {}", self.addr))?
            .serve(make_svc);
        info!("健康检查服务器启动在 {}", self.addr);

        server
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("健康检查服务器错误")?;
        info!("健康检查服务器已停止");
        Ok(())
    }
}

/// 请求路由
pub async fn route(controller: &IdentityController, req: Request<Body>) -> Response<Body> {
    match req.uri().path() {
        "/health" => handle_health_check(controller).await,
        "/ready" => handle_readiness_check(controller).await,
        "/metrics" => handle_metrics(controller),
        _ => text(StatusCode::NOT_FOUND, "Not Found".to_string()),
    }
}

async fn handle_health_check(controller: &IdentityController) -> Response<Body> {
    let report = HealthReport::collect(controller).await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    match serde_json::to_string(&report) {
        Ok(body) => {
            let mut res = Response::new(Body::from(body));
            *res.status_mut() = status;
            res.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            res
        }
        Err(e) => {
            error!("序列化健康状态失败: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn handle_readiness_check(controller: &IdentityController) -> Response<Body> {
    if controller.all_ready().await {
        text(StatusCode::OK, "Ready".to_string())
    } else {
        text(StatusCode::SERVICE_UNAVAILABLE, "Not Ready".to_string())
    }
}

fn handle_metrics(controller: &IdentityController) -> Response<Body> {
    let metrics = controller.metrics();
    match metrics.encode() {
        Ok(body) => {
            let mut res = Response::new(Body::from(body));
            if let Ok(value) = hyper::header::HeaderValue::from_str(&metrics.content_type()) {
                res.headers_mut().insert(CONTENT_TYPE, value);
            }
            res
        }
        Err(e) => {
            error!("导出指标失败: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    res
}
