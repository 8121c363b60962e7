//! Kubernetes Secret 密钥存储
//!
//! 每个条目保存为一个 `Opaque` 类型的 Secret，值放在 `value` 字段中，
//! 原始键与有权读取的请求方记录在注解上。写入使用 server-side apply，
//! 同名条目整体替换。

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use hdfs_guard_common::{Error, Result};
use hdfs_guard_controller::secrets::{SecretStore, CONTROLLER_SCOPE};

/// 字段管理器名称
const FIELD_MANAGER: &str = "hdfs-guard-operator";

/// 记录原始键的注解
pub const KEY_ANNOTATION: &str = "hdfs-guard.io/key";

/// 记录授权请求方的注解，逗号分隔
pub const ENTITLED_ANNOTATION: &str = "hdfs-guard.io/entitled";

/// 所有条目共有的标签
pub const MANAGED_LABEL: &str = "hdfs-guard.io/managed";

/// 保存值的数据字段
const VALUE_FIELD: &str = "value";

/// Secret 名称前缀
const NAME_PREFIX: &str = "hdfs-guard-";

/// Secret 名称中取自原始键的最大长度
const MAX_STEM_LEN: usize = 200;

/// 基于 Kubernetes Secret 的密钥存储
#[derive(Clone)]
pub struct KubeSecretStore {
    api: Api<Secret>,
}

impl KubeSecretStore {
    /// 使用客户端默认命名空间
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::default_namespaced(client),
        }
    }

    /// 使用指定命名空间
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

/// 由条目键得到 Secret 名称
///
/// Kerberos 主体含有 `/`、`@` 与大写字母，不能直接作为对象名称；
/// 名称中附加原始键的哈希，避免规范化后的冲突。
pub fn secret_name(key: &str) -> String {
    let mut stem: String = key
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.') => c,
            _ => '-',
        })
        .collect();
    stem.truncate(MAX_STEM_LEN);
    let stem = stem.trim_matches(|c| c == '-' || c == '.');
    format!("{}{}-{:08x}", NAME_PREFIX, stem, fnv1a(key.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// 构造条目对应的 Secret 对象
pub fn build_secret(key: &str, value: Vec<u8>, entitled: &[String]) -> Secret {
    let annotations = BTreeMap::from([
        (KEY_ANNOTATION.to_string(), key.to_string()),
        (ENTITLED_ANNOTATION.to_string(), entitled.join(",")),
    ]);
    let labels = BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);

    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(key)),
            annotations: Some(annotations),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(VALUE_FIELD.to_string(), ByteString(value))])),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

/// Secret 上记录的授权请求方
pub fn entitled(secret: &Secret) -> Vec<String> {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ENTITLED_ANNOTATION))
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// 按授权读取 Secret 中的值
pub fn read_value(secret: &Secret, key: &str, requester: &str) -> Result<Vec<u8>> {
    let permitted =
        requester == CONTROLLER_SCOPE || entitled(secret).iter().any(|e| e == requester);
    if !permitted {
        warn!("拒绝 {} 读取密钥条目 {}", requester, key);
        return Err(Error::AccessDenied {
            key: key.to_string(),
            requester: requester.to_string(),
        });
    }

    secret
        .data
        .as_ref()
        .and_then(|data| data.get(VALUE_FIELD))
        .map(|value| value.0.clone())
        .ok_or_else(|| Error::SecretNotFound(format!("{} 缺少 {} 字段", key, VALUE_FIELD)))
}

fn kube_error(e: kube::Error) -> Error {
    Error::Kube(e.to_string())
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn put(&self, key: &str, value: Vec<u8>, entitled: &[String]) -> Result<()> {
        let secret = build_secret(key, value, entitled);
        let name = secret_name(key);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api
            .patch(&name, &params, &Patch::Apply(&secret))
            .await
            .map_err(kube_error)?;
        debug!("写入 Secret {}（条目 {}）", name, key);
        Ok(())
    }

    async fn get(&self, key: &str, requester: &str) -> Result<Option<Vec<u8>>> {
        let name = secret_name(key);
        match self.api.get_opt(&name).await.map_err(kube_error)? {
            Some(secret) => read_value(&secret, key, requester).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let name = secret_name(key);
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!("删除 Secret {}（条目 {}）", name, key);
                Ok(true)
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(kube_error(e)),
        }
    }
}
