//! HTTPS 流量闸门
//!
//! 用任务绑定器当前采用的证书终止 TLS，只在任务处于 `Ready` 时接受连接。
//! 证书轮换期间，绑定器尚未采用新证书时继续使用旧证书，
//! 旧证书移出签发器的验证集合后拒绝连接。
//! 未携带 SPNEGO 令牌的请求返回 401 并要求 `Negotiate` 认证；
//! 令牌验证通过后，发起方主体经映射解析器解析，未映射时返回 403。

use async_trait::async_trait;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hdfs_guard_common::{Certificate, Error, Result, TaskIdentity};

use crate::identity::{BindingState, CertificateIssuer, IdentityBinder};
use crate::mapping::{AuthMappingResolver, Resolution};
use crate::tls::server_config;

/// SPNEGO 令牌验证
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpnegoAcceptor: Send + Sync {
    /// 验证 base64 编码的令牌，返回发起方主体
    async fn accept(&self, token: &str) -> Result<String>;
}

/// 拒绝所有令牌的验证器
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllAcceptor;

#[async_trait]
impl SpnegoAcceptor for RejectAllAcceptor {
    async fn accept(&self, _token: &str) -> Result<String> {
        Err(Error::Authentication("未配置 SPNEGO 验证".to_string()))
    }
}

/// HTTPS 流量闸门
pub struct HttpsGate {
    task: TaskIdentity,
    state: watch::Receiver<BindingState>,
    certificate: watch::Receiver<Option<Certificate>>,
    issuer: Arc<CertificateIssuer>,
    acceptor: Arc<dyn SpnegoAcceptor>,
    resolver: Arc<AuthMappingResolver>,
}

impl HttpsGate {
    /// 创建闸门
    pub fn new(
        task: TaskIdentity,
        state: watch::Receiver<BindingState>,
        certificate: watch::Receiver<Option<Certificate>>,
        issuer: Arc<CertificateIssuer>,
        acceptor: Arc<dyn SpnegoAcceptor>,
        resolver: Arc<AuthMappingResolver>,
    ) -> Self {
        Self {
            task,
            state,
            certificate,
            issuer,
            acceptor,
            resolver,
        }
    }

    /// 为绑定器的任务创建闸门
    pub fn for_binder(
        binder: &IdentityBinder,
        issuer: Arc<CertificateIssuer>,
        acceptor: Arc<dyn SpnegoAcceptor>,
        resolver: Arc<AuthMappingResolver>,
    ) -> Self {
        Self::new(
            binder.task().clone(),
            binder.subscribe(),
            binder.subscribe_certificate(),
            issuer,
            acceptor,
            resolver,
        )
    }

    /// 当前可以对外出示的证书
    pub async fn serving_certificate(&self) -> Result<Certificate> {
        let dns_name = self.task.dns_name();
        let certificate = self
            .certificate
            .borrow()
            .clone()
            .ok_or_else(|| Error::NotReady(dns_name.clone()))?;
        if !self.issuer.is_trusted(&dns_name, certificate.serial()).await {
            return Err(Error::NotReady(format!(
                "{} 的证书 {} 已不在验证集合中",
                dns_name,
                certificate.serial()
            )));
        }
        Ok(certificate)
    }

    /// 任务角色的默认 HTTPS 地址
    pub fn default_addr(&self) -> Option<SocketAddr> {
        self.task
            .role
            .default_https_port()
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// 接受连接直到被取消
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!(
            "任务 {} 的 HTTPS 端口监听在 {}",
            self.task,
            listener.local_addr()?
        );
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("任务 {} 的 HTTPS 端口关闭", self.task);
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            if !self.state.borrow().is_ready() {
                debug!("任务 {} 未就绪，拒绝来自 {} 的连接", self.task, peer);
                continue;
            }

            let gate = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gate.handle_connection(stream).await {
                    debug!("来自 {} 的连接失败: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: tokio::net::TcpStream) -> Result<()> {
        let certificate = self.serving_certificate().await?;
        let acceptor = TlsAcceptor::from(server_config(&certificate)?);
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::Handshake(format!("{}: {}", self.task, e)))?;

        let gate = self.clone();
        let service = service_fn(move |req| {
            let gate = gate.clone();
            async move { Ok::<_, Infallible>(gate.handle(req).await) }
        });
        Http::new()
            .serve_connection(tls, service)
            .await
            .map_err(|e| Error::Handshake(format!("HTTP 连接错误: {}", e)))
    }

    /// 处理单个请求
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let token = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Negotiate "))
            .map(str::trim)
            .filter(|token| !token.is_empty());

        let Some(token) = token else {
            return unauthorized();
        };

        let principal = match self.acceptor.accept(token).await {
            Ok(principal) => principal,
            Err(e) => {
                warn!("任务 {} 的 SPNEGO 验证失败: {}", self.task, e);
                return unauthorized();
            }
        };

        match self.resolver.resolve(&principal) {
            Resolution::Mapped { username, .. } => {
                let body = serde_json::json!({
                    "user": username,
                    "task": self.task.dns_name(),
                });
                response(StatusCode::OK, "application/json", body.to_string())
            }
            Resolution::Unmapped => response(
                StatusCode::FORBIDDEN,
                "text/plain",
                format!("Forbidden: {} is not mapped to a local user", principal),
            ),
        }
    }
}

fn unauthorized() -> Response<Body> {
    let mut res = response(
        StatusCode::UNAUTHORIZED,
        "text/plain",
        "Authentication required".to_string(),
    );
    res.headers_mut()
        .insert(WWW_AUTHENTICATE, hyper::header::HeaderValue::from_static("Negotiate"));
    res
}

fn response(status: StatusCode, content_type: &'static str, body: String) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::SelfSignedCa;
    use crate::identity::IssuerConfig;
    use crate::mapping::MappingRuleSpec;
    use crate::metrics::GuardMetrics;
    use hdfs_guard_common::Role;

    fn resolver() -> Arc<AuthMappingResolver> {
        Arc::new(
            AuthMappingResolver::from_specs(
                "LOCAL",
                &[MappingRuleSpec::new("RULE:[1:$1@$0](.*@LOCAL)s/@.*//")],
                Arc::new(GuardMetrics::new().unwrap()),
            )
            .unwrap(),
        )
    }

    fn gate(acceptor: Arc<dyn SpnegoAcceptor>, state: BindingState) -> HttpsGate {
        let metrics = Arc::new(GuardMetrics::new().unwrap());
        let ca = Arc::new(SelfSignedCa::new("hdfs", &["hdfs"]).unwrap());
        let issuer = Arc::new(CertificateIssuer::new(ca, IssuerConfig::default(), metrics));
        let (_tx, rx) = watch::channel(state);
        let (_cert_tx, cert_rx) = watch::channel(None);
        HttpsGate::new(
            TaskIdentity::new("hdfs", Role::Name, 0),
            rx,
            cert_rx,
            issuer,
            acceptor,
            resolver(),
        )
    }

    fn request(authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let gate = gate(Arc::new(RejectAllAcceptor), BindingState::Ready);
        for auth in [None, Some("Basic abc"), Some("Negotiate ")] {
            let res = gate.handle(request(auth)).await;
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(res.headers()[WWW_AUTHENTICATE], "Negotiate");
        }
    }

    #[tokio::test]
    async fn test_rejected_token_is_401() {
        let gate = gate(Arc::new(RejectAllAcceptor), BindingState::Ready);
        let res = gate.handle(request(Some("Negotiate YII="))).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_accepted_token_is_resolved() {
        let mut acceptor = MockSpnegoAcceptor::new();
        acceptor
            .expect_accept()
            .returning(|token| match token {
                "alice-token" => Ok("alice@LOCAL".to_string()),
                _ => Ok("mallory@EVIL".to_string()),
            });
        let gate = gate(Arc::new(acceptor), BindingState::Ready);

        let res = gate.handle(request(Some("Negotiate alice-token"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["user"], "alice");
        assert_eq!(json["task"], "name-0-node.hdfs");

        let res = gate.handle(request(Some("Negotiate other"))).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_no_certificate_before_binding() {
        let gate = gate(Arc::new(RejectAllAcceptor), BindingState::Ready);
        assert!(matches!(
            gate.serving_certificate().await,
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_default_addr_per_role() {
        let gate = gate(Arc::new(RejectAllAcceptor), BindingState::Unbound);
        assert_eq!(gate.default_addr().map(|a| a.port()), Some(9003));
    }
}
