//! 指标模块
//!
//! 该模块收集身份生命周期的统计数据，如各绑定状态的任务数、
//! 凭据供应次数、证书签发次数与映射解析结果，并以 Prometheus 格式导出。

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use hdfs_guard_common::{Error, Result};

/// 身份生命周期指标
#[derive(Clone)]
pub struct GuardMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 各绑定状态的任务数
    binding_states: IntGaugeVec,
    /// 凭据供应次数
    provisions: IntCounterVec,
    /// 证书签发次数
    certificates: IntCounterVec,
    /// 映射解析次数
    resolutions: IntCounterVec,
}

impl GuardMetrics {
    /// 创建并注册指标
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let binding_states = IntGaugeVec::new(
            Opts::new("hdfs_guard_binding_state", "Number of tasks per identity binding state"),
            &["state"],
        )
        .map_err(metric_error)?;
        let provisions = IntCounterVec::new(
            Opts::new("hdfs_guard_provisions_total", "Credential provisioning operations by outcome"),
            &["outcome"],
        )
        .map_err(metric_error)?;
        let certificates = IntCounterVec::new(
            Opts::new("hdfs_guard_certificates_total", "Certificate issue and reissue operations"),
            &["kind"],
        )
        .map_err(metric_error)?;
        let resolutions = IntCounterVec::new(
            Opts::new("hdfs_guard_mapping_resolutions_total", "Principal mapping resolutions by result"),
            &["result"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(binding_states.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(provisions.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(certificates.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(resolutions.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            binding_states,
            provisions,
            certificates,
            resolutions,
        })
    }

    /// 记录一次状态迁移
    pub fn record_transition(&self, from: Option<&str>, to: &str) {
        if let Some(from) = from {
            self.binding_states.with_label_values(&[from]).dec();
        }
        self.binding_states.with_label_values(&[to]).inc();
    }

    /// 任务不再被跟踪时移出其所在状态
    pub fn record_exit(&self, state: &str) {
        self.binding_states.with_label_values(&[state]).dec();
    }

    /// 记录一次凭据供应
    pub fn record_provision(&self, outcome: &str) {
        self.provisions.with_label_values(&[outcome]).inc();
    }

    /// 记录一次证书操作
    pub fn record_certificate(&self, kind: &str) {
        self.certificates.with_label_values(&[kind]).inc();
    }

    /// 记录一次映射解析
    pub fn record_resolution(&self, mapped: bool) {
        let result = if mapped { "mapped" } else { "unmapped" };
        self.resolutions.with_label_values(&[result]).inc();
    }

    /// 处于指定状态的任务数
    pub fn binding_state_count(&self, state: &str) -> i64 {
        self.binding_states.with_label_values(&[state]).get()
    }

    /// 指定结果的供应次数
    pub fn provision_count(&self, outcome: &str) -> u64 {
        self.provisions.with_label_values(&[outcome]).get()
    }

    /// 指定类型的证书操作次数
    pub fn certificate_count(&self, kind: &str) -> u64 {
        self.certificates.with_label_values(&[kind]).get()
    }

    /// 以文本格式导出所有指标
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Config(format!("指标编码失败: {}", e)))
    }

    /// 导出格式的 Content-Type
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Prometheus 注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Config(format!("指标注册失败: {}", e))
}
