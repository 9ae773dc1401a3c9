//! 工具层：Tool trait、注册表、参数规范化、Sandbox 与四个内置工具

pub mod anomalies;
pub mod args;
pub mod chart;
pub mod forecast;
pub mod registry;
pub mod sandbox;
pub mod statement;

use std::sync::Arc;

pub use anomalies::AnomalyTool;
pub use args::{normalize_argument_text, parse_json_object, strip_code_fence, strip_outer_delimiters};
pub use chart::{ChartSpec, ChartTool, ChartType};
pub use forecast::ForecastTool;
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use sandbox::{ToolResult, ToolSandbox};
pub use statement::StatementTool;

use crate::backend::BackendExecutor;
use crate::config::AnalyticsSection;

pub const EXECUTE_STATEMENT: &str = "execute_statement";
pub const COMPUTE_ANOMALIES: &str = "compute_anomalies";
pub const COMPUTE_FORECAST: &str = "compute_forecast";
pub const RENDER_CHART_SPEC: &str = "render_chart_spec";

/// 注册全部四个工具
pub fn default_registry(backend: Arc<BackendExecutor>, analytics: &AnalyticsSection) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(StatementTool::new(backend));
    registry.register(AnomalyTool::new(analytics.anomaly_threshold));
    registry.register(ForecastTool::new(
        analytics.forecast_periods,
        analytics.max_forecast_periods,
    ));
    registry.register(ChartTool);
    registry
}
