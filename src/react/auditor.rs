//! Shadow Auditor：终止后对最终回答做一次事后评分
//!
//! groundedness / completeness 由 completion 服务评判（[0,1] 或 [0,100]，统一归一到 [0,100]）；
//! 另有确定性标记：无观察、回答中的数字在任何观察里都找不到、低分。
//! 结论只写入 transcript，不影响路由，也不阻断回答的交付。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ToolInvocationRecord, ToolOutcome};
use crate::llm::{complete_with_timeout, extract_json_object, LlmClient};
use crate::memory::Message;
use crate::react::prompts::AUDITOR_PROMPT;

const MAX_EVIDENCE_CHARS: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditFlag {
    /// 评判失败，分数置 0
    EvaluationFailed,
    NoObservations,
    /// 回答中的数字在观察中找不到
    UngroundedFigures,
    LowGroundedness,
    LowCompleteness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub groundedness_score: u8,
    pub completeness_score: u8,
    pub flags: Vec<AuditFlag>,
    pub reasoning: String,
}

impl AuditVerdict {
    pub fn has_flag(&self, flag: AuditFlag) -> bool {
        self.flags.contains(&flag)
    }
}

pub struct ShadowAuditor {
    llm: Arc<dyn LlmClient>,
    prompt_template: String,
    low_score_threshold: u8,
    timeout: Duration,
}

impl ShadowAuditor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            prompt_template: AUDITOR_PROMPT.to_string(),
            low_score_threshold: 50,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_low_score_threshold(mut self, threshold: u8) -> Self {
        self.low_score_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// completeness 以用户原始请求的范围为准
    pub async fn audit(
        &self,
        user_request: &str,
        final_answer: &str,
        observations: &[ToolInvocationRecord],
    ) -> AuditVerdict {
        let payloads: Vec<&Value> = observations
            .iter()
            .filter_map(|o| match &o.outcome {
                ToolOutcome::Success { payload } => Some(payload),
                ToolOutcome::Failure { .. } => None,
            })
            .collect();

        let evidence = evidence_text(&payloads);
        let prompt = self
            .prompt_template
            .replace("{request}", user_request)
            .replace("{evidence}", &evidence)
            .replace("{answer}", final_answer);

        let judged = match complete_with_timeout(self.llm.as_ref(), &[Message::user(prompt)], self.timeout).await {
            Ok(text) => parse_scores(&text),
            Err(e) => {
                tracing::warn!(error = %e, "audit completion failed");
                None
            }
        };

        let mut flags = Vec::new();
        let (groundedness_score, completeness_score, reasoning) = match judged {
            Some(s) => s,
            None => {
                flags.push(AuditFlag::EvaluationFailed);
                (0, 0, "Evaluation failed.".to_string())
            }
        };

        if payloads.is_empty() {
            flags.push(AuditFlag::NoObservations);
        } else if !ungrounded_figures(final_answer, &payloads).is_empty() {
            flags.push(AuditFlag::UngroundedFigures);
        }
        if !flags.contains(&AuditFlag::EvaluationFailed) {
            if groundedness_score < self.low_score_threshold {
                flags.push(AuditFlag::LowGroundedness);
            }
            if completeness_score < self.low_score_threshold {
                flags.push(AuditFlag::LowCompleteness);
            }
        }

        let verdict = AuditVerdict {
            groundedness_score,
            completeness_score,
            flags,
            reasoning,
        };
        tracing::info!(
            groundedness = verdict.groundedness_score,
            completeness = verdict.completeness_score,
            flags = ?verdict.flags,
            "shadow audit"
        );
        verdict
    }
}

fn evidence_text(payloads: &[&Value]) -> String {
    if payloads.is_empty() {
        return "(no tool results)".to_string();
    }
    let mut s = payloads
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    if s.len() > MAX_EVIDENCE_CHARS {
        let cut = (0..=MAX_EVIDENCE_CHARS)
            .rev()
            .find(|i| s.is_char_boundary(*i))
            .unwrap_or(0);
        s.truncate(cut);
        s.push_str("\n...(truncated)");
    }
    s
}

fn parse_scores(text: &str) -> Option<(u8, u8, String)> {
    let v = extract_json_object(text)?;
    let g = normalise_score(v.get("groundedness").or_else(|| v.get("groundedness_score"))?)?;
    let c = normalise_score(v.get("completeness").or_else(|| v.get("completeness_score"))?)?;
    let reasoning = v
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();
    Some((g, c, reasoning))
}

/// [0,1] 视为比例，(1,100] 视为百分制
fn normalise_score(v: &Value) -> Option<u8> {
    let x = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok()?,
        _ => return None,
    };
    if !x.is_finite() {
        return None;
    }
    let scaled = if x <= 1.0 { x * 100.0 } else { x };
    Some(scaled.round().clamp(0.0, 100.0) as u8)
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d[\d,]*(?:\.\d+)?").expect("static regex"))
}

/// 回答中在观察里找不到的数字；≤ 10 的整数（序号、计数）不检查
pub fn ungrounded_figures(answer: &str, payloads: &[&Value]) -> Vec<String> {
    let text: String = payloads.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" ");
    let mut evidence = Vec::new();
    for p in payloads {
        collect_numbers(p, &mut evidence);
    }

    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for m in number_re().find_iter(answer) {
        let literal = m.as_str().trim_end_matches(',');
        let plain = literal.replace(',', "");
        let Ok(x) = plain.parse::<f64>() else { continue };
        if x.fract() == 0.0 && x.abs() <= 10.0 {
            continue;
        }
        if text.contains(&plain) || evidence.iter().any(|e| same_at_precision(x, &plain, *e)) {
            continue;
        }
        if seen.insert(plain.clone()) {
            missing.push(literal.to_string());
        }
    }
    missing
}

fn collect_numbers(v: &Value, out: &mut Vec<f64>) {
    match v {
        Value::Number(n) => out.extend(n.as_f64()),
        Value::String(s) => out.extend(s.trim().parse::<f64>().ok()),
        Value::Array(a) => a.iter().for_each(|x| collect_numbers(x, out)),
        Value::Object(o) => o.values().for_each(|x| collect_numbers(x, out)),
        _ => {}
    }
}

/// 回答中的数字是否为证据值按同样小数位四舍五入后的结果
fn same_at_precision(x: f64, literal: &str, evidence: f64) -> bool {
    let decimals = literal.split_once('.').map(|(_, f)| f.len()).unwrap_or(0) as i32;
    let half_ulp = 0.5 * 10f64.powi(-decimals);
    (x - evidence).abs() <= half_ulp + 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkerId;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use chrono::Utc;
    use serde_json::{json, Map};

    fn observation(payload: Value) -> ToolInvocationRecord {
        ToolInvocationRecord {
            worker: WorkerId::Engineer,
            tool_name: "execute_statement".into(),
            raw_arguments: "SELECT 1".into(),
            arguments: Map::new(),
            attempt_number: 1,
            outcome: ToolOutcome::Success { payload },
            row_count: Some(1),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_normalise_score() {
        assert_eq!(normalise_score(&json!(0.85)), Some(85));
        assert_eq!(normalise_score(&json!(72)), Some(72));
        assert_eq!(normalise_score(&json!(140)), Some(100));
        assert_eq!(normalise_score(&json!("90%")), Some(90));
        assert_eq!(normalise_score(&json!(null)), None);
    }

    #[test]
    fn test_ungrounded_figures() {
        let payload = json!({"rows": [{"region": "EU", "revenue": 1234.5678}, {"region": "US", "revenue": 9000}]});
        let p = [&payload];
        assert!(ungrounded_figures("EU made 1,234.57 and US 9,000 across 2 regions.", &p).is_empty());
        assert_eq!(ungrounded_figures("EU made 5,555.", &p), vec!["5,555".to_string()]);
    }

    #[tokio::test]
    async fn test_audit_grounded_answer() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"groundedness": 0.95, "completeness": 0.8, "reasoning": "Matches the rows."}"#,
        ]));
        let auditor = ShadowAuditor::new(llm);
        let v = auditor
            .audit("What is total revenue?", "Total revenue is 420.", &[observation(json!({"rows": [{"total": 420}]}))])
            .await;
        assert_eq!(v.groundedness_score, 95);
        assert_eq!(v.completeness_score, 80);
        assert!(v.flags.is_empty());
    }

    #[tokio::test]
    async fn test_audit_failure_scores_zero() {
        let llm = Arc::new(ScriptedLlmClient::default().then_error(LlmError::Timeout(60)));
        let v = ShadowAuditor::new(llm).audit("hi", "Hello!", &[]).await;
        assert_eq!((v.groundedness_score, v.completeness_score), (0, 0));
        assert!(v.has_flag(AuditFlag::EvaluationFailed));
        assert!(v.has_flag(AuditFlag::NoObservations));
        assert!(!v.has_flag(AuditFlag::LowGroundedness));
        assert_eq!(v.reasoning, "Evaluation failed.");
    }

    #[tokio::test]
    async fn test_low_scores_flagged() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"groundedness": 20, "completeness": 90, "reasoning": "Invented numbers."}"#,
        ]));
        let v = ShadowAuditor::new(llm)
            .audit("What is revenue?", "Revenue is 777.", &[observation(json!({"rows": [{"total": 420}]}))])
            .await;
        assert!(v.has_flag(AuditFlag::LowGroundedness));
        assert!(!v.has_flag(AuditFlag::LowCompleteness));
        assert!(v.has_flag(AuditFlag::UngroundedFigures));
    }

    #[tokio::test]
    async fn test_judge_sees_user_request() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"groundedness": 1.0, "completeness": 0.4, "reasoning": "US was not covered."}"#,
        ]));
        let v = ShadowAuditor::new(llm.clone())
            .audit(
                "Compare EU and US revenue",
                "EU revenue is 520.",
                &[observation(json!({"rows": [{"region": "EU", "total": 520}]}))],
            )
            .await;
        assert!(v.has_flag(AuditFlag::LowCompleteness));
        let prompt = llm.call(0).unwrap();
        assert!(prompt[0].content.contains("Compare EU and US revenue"));
        assert!(prompt[0].content.contains("EU revenue is 520."));
    }
}
