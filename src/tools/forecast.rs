//! compute_forecast：对日期序数做最小二乘线性趋势，向后投影 N 个月末

use async_trait::async_trait;
use chrono::{Datelike, Months, NaiveDate, NaiveDateTime};
use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::tools::args::{as_number, optional_str, parse_json_object, records_argument};
use crate::tools::{Tool, ToolContext, COMPUTE_FORECAST};

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ForecastArgs {
    /// 行数组；省略时使用最近一次抽取的结果
    data: Option<Vec<Value>>,
    /// 日期列，默认 ds
    date_field: Option<String>,
    /// 数值列，默认 y
    value_field: Option<String>,
    /// 向后投影的月数
    periods: Option<u32>,
}

pub struct ForecastTool {
    default_periods: usize,
    max_periods: usize,
}

impl ForecastTool {
    pub fn new(default_periods: usize, max_periods: usize) -> Self {
        Self {
            default_periods,
            max_periods: max_periods.max(1),
        }
    }

    fn periods(&self, args: &Map<String, Value>) -> Result<usize, ToolError> {
        match args.get("periods") {
            None | Some(Value::Null) => Ok(self.default_periods.clamp(1, self.max_periods)),
            Some(v) => match v.as_u64().or_else(|| as_number(v).filter(|x| x.fract() == 0.0).map(|x| x as u64)) {
                Some(0) | None => Err(ToolError::argument(format!(
                    "`periods` must be a positive integer, got {v}"
                ))),
                Some(n) => Ok((n as usize).min(self.max_periods)),
            },
        }
    }
}

#[async_trait]
impl Tool for ForecastTool {
    fn name(&self) -> &str {
        COMPUTE_FORECAST
    }

    fn description(&self) -> &str {
        "Fit a linear trend to a (date, value) series and project it forward by `periods` month-ends. \
         Expects columns `ds` and `y` unless `date_field` / `value_field` are given."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(ForecastArgs)).unwrap_or_default()
    }

    fn parse_arguments(&self, raw: &str) -> Result<Map<String, Value>, ToolError> {
        let args = parse_json_object(raw)?;
        optional_str(&args, "date_field")?;
        optional_str(&args, "value_field")?;
        self.periods(&args)?;
        Ok(args)
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let rows = records_argument(args, ctx)?;
        let periods = self.periods(args)?;
        let (date_field, value_field) = resolve_fields(args, &rows)?;

        let mut points: Vec<(NaiveDate, f64)> = rows
            .iter()
            .filter_map(|row| {
                let d = row.get(&date_field).and_then(|v| v.as_str()).and_then(parse_date)?;
                let y = row.get(&value_field).and_then(as_number)?;
                Some((d, y))
            })
            .collect();
        points.sort_by_key(|(d, _)| *d);

        if points.len() < 2 {
            return Err(ToolError::computation(format!(
                "need at least 2 (`{date_field}`, `{value_field}`) points, found {}",
                points.len()
            )));
        }

        let fit = LinearFit::least_squares(&points).ok_or_else(|| {
            ToolError::computation("all observations share the same date; cannot fit a trend")
        })?;

        let last = points[points.len() - 1].0;
        let forecast: Vec<Value> = future_month_ends(last, periods)
            .into_iter()
            .map(|ds| {
                serde_json::json!({
                    "ds": ds.format("%Y-%m-%d").to_string(),
                    "y_hat": round2(fit.predict(ds)),
                    "trend": "forecast",
                })
            })
            .collect();

        Ok(serde_json::json!({
            "date_field": date_field,
            "value_field": value_field,
            "history_points": points.len(),
            "model": {
                "slope_per_day": fit.slope,
                "intercept": fit.intercept,
                "direction": fit.direction(),
            },
            "forecast": forecast,
        }))
    }
}

/// 显式列名优先；默认 ds / y 缺失时自动识别第一个日期列与第一个数值列
fn resolve_fields(
    args: &Map<String, Value>,
    rows: &[Map<String, Value>],
) -> Result<(String, String), ToolError> {
    let first = rows
        .first()
        .ok_or_else(|| ToolError::computation("no data to forecast"))?;

    let date_field = match optional_str(args, "date_field")? {
        Some(f) => f.to_string(),
        None if first.contains_key("ds") => "ds".to_string(),
        None => first
            .iter()
            .find(|(_, v)| v.as_str().and_then(parse_date).is_some())
            .map(|(k, _)| k.clone())
            .ok_or_else(|| ToolError::computation("no date column in data"))?,
    };
    let value_field = match optional_str(args, "value_field")? {
        Some(f) => f.to_string(),
        None if first.contains_key("y") => "y".to_string(),
        None => first
            .iter()
            .find(|(k, v)| **k != date_field && matches!(v, Value::Number(_)))
            .map(|(k, _)| k.clone())
            .ok_or_else(|| ToolError::computation("no numeric column in data"))?,
    };
    Ok((date_field, value_field))
}

/// 接受日期、日期时间与 YYYY-MM（按月初）
fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").ok())
}

/// last 所在月之后 N 个月的月末
fn future_month_ends(last: NaiveDate, periods: usize) -> Vec<NaiveDate> {
    let Some(month_start) = last.with_day(1) else {
        return Vec::new();
    };
    (1..=periods as u32)
        .filter_map(|k| {
            month_start
                .checked_add_months(Months::new(k + 1))
                .and_then(|d| d.pred_opt())
        })
        .collect()
}

struct LinearFit {
    slope: f64,
    intercept: f64,
}

impl LinearFit {
    /// x 为公元日序数
    fn least_squares(points: &[(NaiveDate, f64)]) -> Option<Self> {
        let n = points.len() as f64;
        let xs: Vec<f64> = points.iter().map(|(d, _)| ordinal(*d)).collect();
        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
        if sxx == 0.0 {
            return None;
        }
        let sxy: f64 = xs
            .iter()
            .zip(points)
            .map(|(x, (_, y))| (x - mean_x) * (y - mean_y))
            .sum();
        let slope = sxy / sxx;
        Some(Self {
            slope,
            intercept: mean_y - slope * mean_x,
        })
    }

    fn predict(&self, d: NaiveDate) -> f64 {
        self.intercept + self.slope * ordinal(d)
    }

    fn direction(&self) -> &'static str {
        if self.slope > 1e-9 {
            "upward"
        } else if self.slope < -1e-9 {
            "downward"
        } else {
            "flat"
        }
    }
}

fn ordinal(d: NaiveDate) -> f64 {
    d.num_days_from_ce() as f64
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
