//! render_chart_spec：生成与渲染器无关的图表描述

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::tools::args::{optional_str, parse_json_object, records_argument};
use crate::tools::{Tool, ToolContext, RENDER_CHART_SPEC};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Scatter,
}

impl ChartType {
    /// 未知类型回退为折线图
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "bar" | "column" => Self::Bar,
            "pie" | "donut" => Self::Pie,
            "scatter" | "point" => Self::Scatter,
            _ => Self::Line,
        }
    }
}

/// 图表描述：渲染端（UI）自行选择绘图库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChartSpec {
    pub chart_type: ChartType,
    pub title: String,
    pub x: String,
    pub y: Vec<String>,
    /// 多个 y 列的柱状图按组并列
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bar_mode: Option<String>,
    pub data: Vec<Map<String, Value>>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ChartArgs {
    /// bar | line | pie | scatter
    chart_type: Option<String>,
    title: Option<String>,
    /// x 轴列（饼图为类别列）
    x: String,
    /// 一个或多个 y 列
    y: Vec<String>,
    /// 行数组；省略时使用最近一次抽取的结果
    data: Option<Vec<Value>>,
}

pub struct ChartTool;

#[async_trait]
impl Tool for ChartTool {
    fn name(&self) -> &str {
        RENDER_CHART_SPEC
    }

    fn description(&self) -> &str {
        "Describe a chart (bar, line, pie or scatter) over the data. Does not draw anything."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(ChartArgs)).unwrap_or_default()
    }

    fn parse_arguments(&self, raw: &str) -> Result<Map<String, Value>, ToolError> {
        let args = parse_json_object(raw)?;
        if optional_str(&args, "x")?.is_none() {
            return Err(ToolError::argument("missing `x`"));
        }
        y_columns(&args)?;
        if args.contains_key("chart_type") {
            optional_str(&args, "chart_type")?;
        } else {
            optional_str(&args, "type")?;
        }
        optional_str(&args, "title")?;
        Ok(args)
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let data = records_argument(args, ctx)?;
        let chart_type = optional_str(args, "chart_type")?
            .or(optional_str(args, "type")?)
            .map(ChartType::parse)
            .unwrap_or(ChartType::Line);
        let x = optional_str(args, "x")?
            .ok_or_else(|| ToolError::argument("missing `x`"))?
            .to_string();
        let mut y = y_columns(args)?;
        if chart_type == ChartType::Pie {
            y.truncate(1);
        }

        if let Some(row) = data.first() {
            let missing: Vec<&str> = std::iter::once(x.as_str())
                .chain(y.iter().map(String::as_str))
                .filter(|c| !row.contains_key(*c))
                .collect();
            if !missing.is_empty() {
                return Err(ToolError::computation(format!(
                    "columns not found in data: {}",
                    missing.join(", ")
                )));
            }
        }

        let spec = ChartSpec {
            chart_type,
            title: optional_str(args, "title")?.unwrap_or("Chart").to_string(),
            bar_mode: (chart_type == ChartType::Bar && y.len() > 1).then(|| "group".to_string()),
            x,
            y,
            data,
        };
        serde_json::to_value(&spec).map_err(|e| ToolError::computation(e.to_string()))
    }
}

/// y 可以是字符串或字符串数组
fn y_columns(args: &Map<String, Value>) -> Result<Vec<String>, ToolError> {
    match args.get("y") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(vec![s.clone()]),
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(String::from)
                    .ok_or_else(|| ToolError::argument("`y` entries must be strings"))
            })
            .collect(),
        _ => Err(ToolError::argument("missing `y`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        let rows = parse_json_object(
            r#"{"rows": [{"region": "EMEA", "q1": 10, "q2": 12}, {"region": "APAC", "q1": 7, "q2": 9}]}"#,
        )
        .unwrap();
        ToolContext {
            row_limit: 100,
            prior_records: rows["rows"]
                .as_array()
                .unwrap()
                .iter()
                .map(|r| r.as_object().unwrap().clone())
                .collect(),
        }
    }

    #[test]
    fn test_chart_type_fallback() {
        assert_eq!(ChartType::parse("BAR"), ChartType::Bar);
        assert_eq!(ChartType::parse("heatmap"), ChartType::Line);
    }

    #[tokio::test]
    async fn test_grouped_bar() {
        let args = ChartTool
            .parse_arguments(r#"{"chart_type": "bar", "x": "region", "y": ["q1", "q2"]}"#)
            .unwrap();
        let out = ChartTool.run(&args, &ctx()).await.unwrap();
        assert_eq!(out["chart_type"], "bar");
        assert_eq!(out["bar_mode"], "group");
        assert_eq!(out["title"], "Chart");
        assert_eq!(out["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pie_uses_first_y() {
        let args = ChartTool
            .parse_arguments(r#"{"type": "pie", "x": "region", "y": ["q1", "q2"], "title": "Share"}"#)
            .unwrap();
        let spec: ChartSpec =
            serde_json::from_value(ChartTool.run(&args, &ctx()).await.unwrap()).unwrap();
        assert_eq!(spec.chart_type, ChartType::Pie);
        assert_eq!(spec.y, vec!["q1"]);
        assert_eq!(spec.title, "Share");
    }

    #[tokio::test]
    async fn test_missing_column_rejected() {
        let args = ChartTool.parse_arguments(r#"{"x": "region", "y": "q9"}"#).unwrap();
        assert!(matches!(
            ChartTool.run(&args, &ctx()).await,
            Err(ToolError::Computation { .. })
        ));
        assert!(matches!(
            ChartTool.parse_arguments(r#"{"x": "region"}"#),
            Err(ToolError::Argument { .. })
        ));
    }
}
