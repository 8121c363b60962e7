//! TLS 工具模块
//!
//! 基于 rustls 构造服务端/客户端配置，并提供 TLS 探测：握手后报告
//! 协商的协议版本、密码套件与对端证书 CN。绑定状态机用内存管道
//! 做一次试握手，验证证书、私钥与 CA 证书包相互一致。

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use hdfs_guard_common::{Certificate, Error, Result, TaskIdentity};

/// 内存管道缓冲区大小
const DUPLEX_BUFFER: usize = 16 * 1024;

/// 安装 ring 加密实现，已安装时忽略
pub fn ensure_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}

/// TLS 握手报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReport {
    /// 协商的协议版本
    pub protocol: String,
    /// 协商的密码套件
    pub cipher_suite: String,
    /// 对端证书 CN
    pub peer_common_name: String,
    /// 对端证书序列号
    pub peer_serial: String,
}

/// 解析 PEM 证书链
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "跳过无效的证书");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(Error::Certificate("PEM 中没有证书".to_string()));
    }
    Ok(certs)
}

/// 解析 PEM 私钥
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Certificate(format!("私钥解析失败: {}", e)))?
        .ok_or_else(|| Error::Certificate("PEM 中没有私钥".to_string()))
}

/// 由 CA 证书包构造信任库
pub fn root_store(ca_bundle: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(parse_certificates(ca_bundle)?);
    debug!(added, ignored, "加载 CA 证书");
    if added == 0 {
        return Err(Error::Certificate("CA 证书包中没有可用证书".to_string()));
    }
    Ok(store)
}

/// 使用任务证书的服务端配置
pub fn server_config(cert: &Certificate) -> Result<Arc<ServerConfig>> {
    ensure_crypto_provider();
    let chain = parse_certificates(&cert.cert_pem)?;
    let key = parse_private_key(cert.key_pem())?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::Certificate(format!("证书与私钥不匹配: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// 只信任 CA 证书包的客户端配置
pub fn client_config(ca_bundle: &str) -> Result<Arc<ClientConfig>> {
    ensure_crypto_provider();
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(ca_bundle)?)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// 证书 CN 必须与任务的 DNS 名称完全一致
pub fn verify_common_name(cert: &Certificate, task: &TaskIdentity) -> Result<()> {
    verify_name(cert.common_name(), &task.dns_name())
}

/// 精确比较名称，大小写与尾部的点都不做归一化
pub fn verify_name(actual: &str, expected: &str) -> Result<()> {
    if actual != expected {
        return Err(Error::NameMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// 在已建立的连接上发起 TLS 握手，返回加密流与握手报告
pub async fn connect<IO>(
    config: Arc<ClientConfig>,
    server_name: &str,
    stream: IO,
) -> Result<(client::TlsStream<IO>, HandshakeReport)>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::Handshake(format!("无效的服务器名称 {}: {}", server_name, e)))?;
    let tls = TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| Error::Handshake(format!("{}: {}", server_name, e)))?;

    let (_, connection) = tls.get_ref();
    let protocol = connection
        .protocol_version()
        .map(|v| format!("{:?}", v))
        .unwrap_or_default();
    let cipher_suite = connection
        .negotiated_cipher_suite()
        .map(|s| format!("{:?}", s.suite()))
        .unwrap_or_default();
    let peer = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| Error::Handshake(format!("{} 未出示证书", server_name)))?;

    let (peer_common_name, peer_serial) = peer_identity(peer)?;
    let report = HandshakeReport {
        protocol,
        cipher_suite,
        peer_common_name,
        peer_serial,
    };
    Ok((tls, report))
}

/// 对已建立的连接做 TLS 探测
pub async fn probe<IO>(
    config: Arc<ClientConfig>,
    server_name: &str,
    stream: IO,
) -> Result<HandshakeReport>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    connect(config, server_name, stream)
        .await
        .map(|(_, report)| report)
}

/// HTTPS 端口探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpsProbe {
    /// TLS 握手报告
    pub handshake: HandshakeReport,
    /// 未认证请求的 HTTP 状态码
    pub status: u16,
    /// `WWW-Authenticate` 响应头
    pub authenticate: Option<String>,
}

/// 不带认证信息访问 HTTPS 端口，报告握手结果与响应状态
pub async fn probe_https(
    addr: SocketAddr,
    server_name: &str,
    ca_bundle: &str,
    timeout: Duration,
) -> Result<HttpsProbe> {
    let config = client_config(ca_bundle)?;
    let exchange = async {
        let stream = TcpStream::connect(addr).await?;
        let (mut tls, handshake) = connect(config, server_name, stream).await?;

        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            server_name
        );
        tls.write_all(request.as_bytes()).await?;
        let mut response = Vec::new();
        // 对端可能不发送 close_notify 就关闭连接
        if let Err(e) = tls.read_to_end(&mut response).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof || response.is_empty() {
                return Err(e.into());
            }
        }
        Ok::<_, Error>((handshake, response))
    };
    let (handshake, response) = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout(format!("探测 {}", addr)))??;

    let text = String::from_utf8_lossy(&response);
    let status = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Handshake(format!("{} 返回了无效的 HTTP 响应", addr)))?;
    let authenticate = text
        .lines()
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("www-authenticate")
                .then(|| value.trim().to_string())
        });

    Ok(HttpsProbe {
        handshake,
        status,
        authenticate,
    })
}

/// 在内存管道上用任务证书与 CA 证书包做一次试握手
pub async fn trial_handshake(
    cert: &Certificate,
    ca_bundle: &str,
    expected_name: &str,
    timeout: Duration,
) -> Result<HandshakeReport> {
    let acceptor = TlsAcceptor::from(server_config(cert)?);
    let client = client_config(ca_bundle)?;
    let (client_io, server_io) = tokio::io::duplex(DUPLEX_BUFFER);

    let server = async move {
        acceptor
            .accept(server_io)
            .await
            .map(|_| ())
            .map_err(|e| Error::Handshake(format!("服务端握手失败: {}", e)))
    };
    let client = probe(client, expected_name, client_io);

    let handshake = async {
        let (server_result, client_result) = tokio::join!(server, client);
        let report = client_result?;
        server_result?;
        Ok::<_, Error>(report)
    };
    let report = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| Error::Timeout(format!("{} 的试握手", expected_name)))??;

    verify_name(&report.peer_common_name, expected_name)?;
    debug!(
        protocol = %report.protocol,
        cipher = %report.cipher_suite,
        "试握手成功: {}",
        expected_name
    );
    Ok(report)
}

/// 对端证书的 CN 与序列号
fn peer_identity(der: &CertificateDer<'_>) -> Result<(String, String)> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| Error::Certificate(format!("对端证书解析失败: {}", e)))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::Certificate("对端证书缺少 CN".to_string()))?;
    Ok((common_name, cert.tbs_certificate.raw_serial_as_string()))
}
