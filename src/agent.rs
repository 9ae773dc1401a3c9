//! 运行 API
//!
//! AgentService 持有共享只读资源（Orchestrator、后端、模式索引），每个运行独占自己的 RunRecord：
//! - start_run：创建运行并在后台推进，返回 RunHandle
//! - submit_approval：Safe Mode 挂起时提交审批
//! - get_transcript：读取最近一次发布的快照（不等待正在执行的步骤）
//! - cancel_run：取消运行，在下一个挂起点生效
//!
//! 不同运行之间没有共享可变状态，可并发执行。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};

use crate::backend::{BackendExecutor, TabularEngine};
use crate::config::{AppConfig, RunConfig};
use crate::core::{
    BackendError, ConversationState, Orchestrator, RunError, RunId, RunPhase, RunRecord,
    SessionSupervisor,
};
use crate::llm::LlmClient;
use crate::memory::{KeywordPatternIndex, PatternRetriever};
use crate::react::{LlmWorker, Router, RunTranscript, ShadowAuditor};
use crate::tools::{default_registry, ToolSandbox};

struct RunSlot {
    record: Arc<Mutex<RunRecord>>,
    publish: watch::Sender<RunTranscript>,
    supervisor: SessionSupervisor,
}

/// start_run 的返回值：订阅该运行的快照
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    rx: watch::Receiver<RunTranscript>,
}

impl RunHandle {
    /// 最近一次发布的快照
    pub fn latest(&self) -> RunTranscript {
        self.rx.borrow().clone()
    }

    /// 等到运行终止或挂起等待审批
    pub async fn wait(&mut self) -> RunTranscript {
        if let Ok(t) = self
            .rx
            .wait_for(|t| !matches!(t.phase, RunPhase::Running))
            .await
        {
            return t.clone();
        }
        self.rx.borrow().clone()
    }

    /// 等到运行终止（期间的审批挂起由调用方另行处理）
    pub async fn wait_halted(&mut self) -> RunTranscript {
        if let Ok(t) = self.rx.wait_for(|t| t.is_halted()).await {
            return t.clone();
        }
        self.rx.borrow().clone()
    }
}

pub struct AgentService {
    orchestrator: Arc<Orchestrator>,
    runs: RwLock<HashMap<RunId, Arc<RunSlot>>>,
    defaults: RunConfig,
}

impl AgentService {
    pub fn new(orchestrator: Orchestrator, defaults: RunConfig) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            runs: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    pub fn builder(worker_llm: Arc<dyn LlmClient>, engine: Arc<dyn TabularEngine>) -> AgentBuilder {
        AgentBuilder::new(worker_llm, engine)
    }

    /// 配置中的默认 RunConfig
    pub fn default_run_config(&self) -> RunConfig {
        self.defaults
    }

    pub async fn start_run(&self, user_text: &str, config: RunConfig) -> RunHandle {
        let run_id = uuid::Uuid::new_v4().to_string();
        let record = RunRecord::new(ConversationState::new(run_id.clone(), user_text), config);
        let (publish, rx) = watch::channel(record.transcript());
        let slot = Arc::new(RunSlot {
            record: Arc::new(Mutex::new(record)),
            publish,
            supervisor: SessionSupervisor::new(run_id.clone()),
        });
        // 先取得锁再登记，保证后台任务先于任何审批执行
        let guard = slot.record.clone().lock_owned().await;
        self.runs.write().await.insert(run_id.clone(), slot.clone());
        tracing::info!(run_id = %run_id, safe_mode = config.safe_mode, "run started");

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let mut record = guard;
            let cancel = slot.supervisor.cancel_token();
            orchestrator.drive(&mut record, &cancel, &slot.publish).await;
        });

        RunHandle { run_id, rx }
    }

    /// 提交审批；拒绝在返回前完成，批准后在后台继续推进
    pub async fn submit_approval(&self, run_id: &str, approved: bool) -> Result<(), RunError> {
        let slot = self.slot(run_id).await?;
        let mut record = slot.record.clone().lock_owned().await;
        let Some(decision) = self
            .orchestrator
            .resolve_approval(&mut record, approved, &slot.publish)
            .await?
        else {
            return Ok(());
        };

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let cancel = slot.supervisor.cancel_token();
            orchestrator.resume(&mut record, decision, &cancel, &slot.publish).await;
        });
        Ok(())
    }

    pub async fn get_transcript(&self, run_id: &str) -> Result<RunTranscript, RunError> {
        let slot = self.slot(run_id).await?;
        let transcript = slot.publish.borrow().clone();
        Ok(transcript)
    }

    /// 订阅一个已存在的运行
    pub async fn subscribe(&self, run_id: &str) -> Result<RunHandle, RunError> {
        let slot = self.slot(run_id).await?;
        Ok(RunHandle {
            run_id: run_id.to_string(),
            rx: slot.publish.subscribe(),
        })
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<(), RunError> {
        let slot = self.slot(run_id).await?;
        if slot.publish.borrow().is_halted() {
            return Err(RunError::AlreadyHalted(run_id.to_string()));
        }
        slot.supervisor.cancel();
        // 正在推进的运行会在下一个挂起点自行终止；挂起中的运行在这里终止
        let mut record = slot.record.lock().await;
        self.orchestrator.cancel_suspended(&mut record, &slot.publish);
        Ok(())
    }

    async fn slot(&self, run_id: &str) -> Result<Arc<RunSlot>, RunError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunError::RunNotFound(run_id.to_string()))
    }
}

/// AgentService 构建器：两个 Worker + Router + 可选 Shadow Auditor
pub struct AgentBuilder {
    worker_llm: Arc<dyn LlmClient>,
    router_llm: Option<Arc<dyn LlmClient>>,
    auditor_llm: Option<Arc<dyn LlmClient>>,
    engine: Arc<dyn TabularEngine>,
    retriever: Option<Arc<dyn PatternRetriever>>,
    config: AppConfig,
}

impl AgentBuilder {
    pub fn new(worker_llm: Arc<dyn LlmClient>, engine: Arc<dyn TabularEngine>) -> Self {
        Self {
            worker_llm,
            router_llm: None,
            auditor_llm: None,
            engine,
            retriever: None,
            config: AppConfig::default(),
        }
    }

    /// Router 使用的轻量模型；未设置时只用关键词分类
    pub fn with_router_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.router_llm = Some(llm);
        self
    }

    /// 审计使用的模型；未设置时与 Worker 相同
    pub fn with_auditor_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.auditor_llm = Some(llm);
        self
    }

    /// 替换默认的关键词模式索引
    pub fn with_retriever(mut self, retriever: Arc<dyn PatternRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// 读取 schema 摘要并组装；schema 读取失败时返回错误
    pub async fn build(self) -> Result<AgentService, BackendError> {
        let cfg = self.config;
        let timeout = Duration::from_secs(cfg.llm.timeouts.request);

        let backend = Arc::new(BackendExecutor::new(self.engine, cfg.backend.query_timeout_secs));
        let schema = backend.describe_schema().await?;
        let registry = default_registry(backend, &cfg.analytics);

        let mut engineer = LlmWorker::engineer(self.worker_llm.clone(), &registry, &schema)
            .with_timeout(timeout);
        if cfg.retrieval.enabled {
            let retriever = self
                .retriever
                .unwrap_or_else(|| Arc::new(KeywordPatternIndex::with_golden_patterns()));
            engineer = engineer.with_retriever(retriever, cfg.retrieval.top_k);
        }
        let scientist = LlmWorker::scientist(self.worker_llm.clone(), &registry, &schema)
            .with_timeout(timeout);

        let router = Router::new(self.router_llm).with_timeout(timeout);
        let mut orchestrator = Orchestrator::new(router, Arc::new(ToolSandbox::new(registry)))
            .with_worker(Arc::new(engineer))
            .with_worker(Arc::new(scientist));
        if cfg.audit.enabled {
            let llm = self.auditor_llm.unwrap_or(self.worker_llm);
            let auditor = ShadowAuditor::new(llm)
                .with_low_score_threshold(cfg.audit.low_score_threshold)
                .with_timeout(timeout);
            orchestrator = orchestrator.with_auditor(Arc::new(auditor));
        }

        tracing::info!(tables = schema.tables.len(), "agent service ready");
        Ok(AgentService::new(orchestrator, cfg.run))
    }
}
