//! compute_anomalies：均值 / 标准差基线，标出 |z| 超过阈值的点

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::tools::args::{
    as_number, optional_positive_f64, optional_str, parse_json_object, records_argument,
};
use crate::tools::{Tool, ToolContext, COMPUTE_ANOMALIES};

#[allow(dead_code)]
#[derive(JsonSchema)]
struct AnomalyArgs {
    /// 行数组；省略时使用最近一次抽取的结果
    data: Option<Vec<Value>>,
    /// 数值列名；省略时取第一个数值列
    column: Option<String>,
    /// 标准差倍数
    threshold: Option<f64>,
}

pub struct AnomalyTool {
    default_threshold: f64,
}

impl AnomalyTool {
    pub fn new(default_threshold: f64) -> Self {
        Self { default_threshold }
    }
}

#[async_trait]
impl Tool for AnomalyTool {
    fn name(&self) -> &str {
        COMPUTE_ANOMALIES
    }

    fn description(&self) -> &str {
        "Flag values whose distance from the mean exceeds `threshold` standard deviations. \
         Returns the baseline statistics and the flagged rows."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(AnomalyArgs)).unwrap_or_default()
    }

    fn parse_arguments(&self, raw: &str) -> Result<Map<String, Value>, ToolError> {
        let args = parse_json_object(raw)?;
        optional_str(&args, "column")?;
        optional_positive_f64(&args, "threshold")?;
        Ok(args)
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let rows = records_argument(args, ctx)?;
        let threshold = optional_positive_f64(args, "threshold")?.unwrap_or(self.default_threshold);
        let column = match optional_str(args, "column")? {
            Some(c) => c.to_string(),
            None => first_numeric_column(&rows)
                .ok_or_else(|| ToolError::computation("no numeric column in data"))?,
        };

        let points: Vec<(usize, f64)> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.get(&column).and_then(as_number).map(|v| (i, v)))
            .collect();
        if points.len() < 2 {
            return Err(ToolError::computation(format!(
                "need at least 2 numeric values in `{column}`, found {}",
                points.len()
            )));
        }

        let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        let stats = Baseline::of(&values);

        let anomalies: Vec<Value> = if stats.std > 0.0 {
            points
                .iter()
                .filter_map(|&(i, v)| {
                    let z = (v - stats.mean) / stats.std;
                    (z.abs() > threshold).then(|| {
                        serde_json::json!({
                            "index": i,
                            "value": v,
                            "z_score": round4(z),
                            "row": Value::Object(rows[i].clone()),
                        })
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(serde_json::json!({
            "column": column,
            "threshold": threshold,
            "baseline": {
                "count": values.len(),
                "mean": round4(stats.mean),
                "std": round4(stats.std),
                "min": stats.min,
                "max": stats.max,
            },
            "anomaly_count": anomalies.len(),
            "anomalies": anomalies,
        }))
    }
}

struct Baseline {
    mean: f64,
    /// 样本标准差（n - 1）
    std: f64,
    min: f64,
    max: f64,
}

impl Baseline {
    fn of(values: &[f64]) -> Self {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Self {
            mean,
            std: var.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

fn first_numeric_column(rows: &[Map<String, Value>]) -> Option<String> {
    let first = rows.first()?;
    first
        .iter()
        .find(|(_, v)| matches!(v, Value::Number(_)))
        .map(|(k, _)| k.clone())
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(values: &[f64]) -> ToolContext {
        ToolContext {
            row_limit: 100,
            prior_records: values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let mut row = Map::new();
                    row.insert("day".into(), Value::from(i as i64));
                    row.insert("amount".into(), Value::from(*v));
                    row
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_flags_outlier_beyond_threshold() {
        let tool = AnomalyTool::new(2.0);
        let mut values = vec![10.0; 20];
        values.push(100.0);
        let out = tool
            .run(&parse_json_object(r#"{"column": "amount"}"#).unwrap(), &ctx_with(&values))
            .await
            .unwrap();
        assert_eq!(out["anomaly_count"], 1);
        assert_eq!(out["anomalies"][0]["index"], 20);
        assert_eq!(out["anomalies"][0]["row"]["amount"], 100.0);
        assert_eq!(out["baseline"]["count"], 21);
        assert_eq!(out["baseline"]["max"], 100.0);
    }

    #[tokio::test]
    async fn test_constant_series_has_no_anomalies() {
        let tool = AnomalyTool::new(3.0);
        let out = tool
            .run(&Map::new(), &ctx_with(&[5.0, 5.0, 5.0]))
            .await
            .unwrap();
        assert_eq!(out["anomaly_count"], 0);
        assert_eq!(out["baseline"]["std"], 0.0);
    }

    #[tokio::test]
    async fn test_sample_std_and_inline_data() {
        let tool = AnomalyTool::new(3.0);
        let args = parse_json_object(r#"{"data": [2, 4, 4, 4, 5, 5, 7, 9]}"#).unwrap();
        let out = tool.run(&args, &ToolContext::default()).await.unwrap();
        assert_eq!(out["column"], "value");
        assert_eq!(out["baseline"]["mean"], 5.0);
        // 样本标准差 sqrt(32 / 7)
        assert_eq!(out["baseline"]["std"], 2.1381);
    }

    #[tokio::test]
    async fn test_insufficient_data_is_computation_error() {
        let tool = AnomalyTool::new(3.0);
        let err = tool.run(&Map::new(), &ctx_with(&[1.0])).await.unwrap_err();
        assert!(matches!(err, ToolError::Computation { .. }));
    }

    #[test]
    fn test_bad_threshold_is_argument_error() {
        let tool = AnomalyTool::new(3.0);
        assert!(matches!(
            tool.parse_arguments(r#"{"threshold": -1}"#),
            Err(ToolError::Argument { .. })
        ));
    }
}
