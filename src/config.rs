//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DATALENS__*` 覆盖（双下划线表示嵌套，如 `DATALENS__RUN__SAFE_MODE=true`）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub run: RunConfig,
    pub backend: BackendSection,
    pub analytics: AnalyticsSection,
    pub retrieval: RetrievalSection,
    pub audit: AuditSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端、模型与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Worker 使用的高推理模型
    #[serde(default = "default_model")]
    pub model: String,
    /// Router 使用的快速轻量模型；未设置时与 model 相同
    pub router_model: Option<String>,
    /// 嵌入模型（语义模式检索）
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            router_model: None,
            embedding_model: default_embedding_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次 completion 调用超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// 单次运行的配置（对调用方暴露：safe_mode / max_retries / row_limit）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Safe Mode：委派给有成本的 Worker 前需要外部审批
    #[serde(default)]
    pub safe_mode: bool,
    /// 自愈循环的最大失败次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 结果量熔断阈值（行数）
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,
    /// 状态机步数上限，防止失控循环
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            safe_mode: false,
            max_retries: default_max_retries(),
            row_limit: default_row_limit(),
            max_steps: default_max_steps(),
        }
    }
}

impl RunConfig {
    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_row_limit(mut self, row_limit: usize) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_row_limit() -> usize {
    100
}

fn default_max_steps() -> usize {
    50
}

/// [backend] 段：数据库文件与单条语句超时
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            database_path: None,
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    30
}

/// [analytics] 段：异常阈值（标准差倍数）与预测期数
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsSection {
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    #[serde(default = "default_forecast_periods")]
    pub forecast_periods: usize,
    #[serde(default = "default_max_forecast_periods")]
    pub max_forecast_periods: usize,
}

impl Default for AnalyticsSection {
    fn default() -> Self {
        Self {
            anomaly_threshold: default_anomaly_threshold(),
            forecast_periods: default_forecast_periods(),
            max_forecast_periods: default_max_forecast_periods(),
        }
    }
}

fn default_anomaly_threshold() -> f64 {
    3.0
}

fn default_forecast_periods() -> usize {
    3
}

fn default_max_forecast_periods() -> usize {
    60
}

/// [retrieval] 段：语义模式检索
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    2
}

/// [audit] 段：影子审计
#[derive(Debug, Clone, Deserialize)]
pub struct AuditSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 低于此分数时附加 low_* 标记（仅提示，不阻断）
    #[serde(default = "default_low_score_threshold")]
    pub low_score_threshold: u8,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            enabled: true,
            low_score_threshold: default_low_score_threshold(),
        }
    }
}

fn default_low_score_threshold() -> u8 {
    50
}

fn default_true() -> bool {
    true
}

/// 从 config 目录加载配置，环境变量 DATALENS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DATALENS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DATALENS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
