//! Result resolver: turns a finished job's exit code and output buffers into an
//! [`AnalysisResult`], or into a [`JobError::ProcessExit`].
//!
//! Extraction strategies, tried in order until one yields something:
//! 1. JSON between `===JSON_OUTPUT_START===` / `===JSON_OUTPUT_END===`
//! 2. first-`{` to last-`}` span parsed as JSON
//! 3. text scraping of the human-readable summary (never fails)
//!
//! A malformed payload in 1 or 2 skips straight to 3 and records `parse_error`.
//! Afterwards the memo file announced on stdout, if readable, replaces `memo`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::JobError;
use crate::progress::ProgressEvent;

pub const JSON_START_MARKER: &str = "===JSON_OUTPUT_START===";
pub const JSON_END_MARKER: &str = "===JSON_OUTPUT_END===";

const SCENARIO_NAMES: [&str; 3] = ["bull", "base", "bear"];
const TRACEBACK_MARKERS: [&str; 2] = ["Traceback", "File \""];
const STDOUT_ERROR_WORDS: [&str; 3] = ["error", "exception", "failed"];

/// Expected return and probability for one scenario, as emitted (no rescaling).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(rename = "return", default)]
    pub expected_return: f64,
    #[serde(alias = "prob", default)]
    pub probability: f64,
}

/// Uniform result shape returned to HTTP callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub recommendation: String,
    pub confidence_score: f64,
    pub scenarios: BTreeMap<String, Scenario>,
    pub memo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macro_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_analysis: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<Value>,
    pub progress_messages: Vec<ProgressEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

/// Everything a finished job leaves behind for the resolver.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub progress: Vec<ProgressEvent>,
}

/// First non-null value under any of `keys` (the program prints snake_case).
fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| obj.get(*k)).find(|v| !v.is_null())
}

/// Numbers may arrive as strings; anything else reads as 0.
fn number(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

fn text(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or_default().to_string()
}

impl Scenario {
    fn from_value(obj: &Map<String, Value>) -> Self {
        Self {
            expected_return: number(field(obj, &["return", "expected_return"])),
            probability: number(field(obj, &["probability", "prob"])),
        }
    }
}

impl AnalysisResult {
    /// Lenient read of the structured payload. Fields of an unexpected type fall
    /// back to their defaults; scenario entries that are not objects are skipped.
    pub fn from_payload(payload: &Value) -> Self {
        let Some(obj) = payload.as_object() else {
            return Self::default();
        };
        let scenarios = field(obj, &["scenarios"])
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(name, v)| Some((name.clone(), Scenario::from_value(v.as_object()?))))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            recommendation: text(field(obj, &["recommendation"])),
            confidence_score: number(field(obj, &["confidence_score", "confidenceScore"])),
            scenarios,
            memo: text(field(obj, &["memo"])),
            market_data: field(obj, &["market_data", "marketData"]).cloned(),
            macro_data: field(obj, &["macro_data", "macroData"]).cloned(),
            risk_analysis: field(obj, &["risk_analysis", "riskAnalysis"]).cloned(),
            timing: field(obj, &["timing"]).cloned(),
            ..Self::default()
        }
    }
}

/// Outcome of one structured extraction attempt.
#[derive(Debug)]
pub enum Extraction {
    Parsed(AnalysisResult),
    /// A candidate was found but did not parse.
    Malformed(String),
    /// Nothing this strategy recognises.
    NotFound,
}

type Strategy = fn(&str) -> Extraction;

const STRUCTURED_STRATEGIES: [(&str, Strategy); 2] = [
    ("sentinel_json", extract_sentinel_json),
    ("bare_json", extract_bare_json),
];

fn parse_payload(raw: &str) -> Extraction {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(v) => Extraction::Parsed(AnalysisResult::from_payload(&v)),
        Err(e) => Extraction::Malformed(e.to_string()),
    }
}

/// Strategy 1: JSON between the sentinel markers.
pub fn extract_sentinel_json(stdout: &str) -> Extraction {
    let Some(start) = stdout.find(JSON_START_MARKER) else {
        return Extraction::NotFound;
    };
    let body_start = start + JSON_START_MARKER.len();
    let Some(len) = stdout[body_start..].find(JSON_END_MARKER) else {
        return Extraction::NotFound;
    };
    parse_payload(&stdout[body_start..body_start + len])
}

/// Strategy 2: outermost `{ ... }` span (first `{` through last `}`).
pub fn extract_bare_json(stdout: &str) -> Extraction {
    static RE_OBJECT: OnceCell<Regex> = OnceCell::new();
    let re = RE_OBJECT.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("json object regex"));
    match re.find(stdout) {
        Some(m) => parse_payload(m.as_str()),
        None => Extraction::NotFound,
    }
}

/// Strategy 3: scrape the human-readable summary. Absent fields stay default.
pub fn extract_from_text(stdout: &str) -> AnalysisResult {
    static RE_RECOMMENDATION: OnceCell<Regex> = OnceCell::new();
    static RE_CONFIDENCE: OnceCell<Regex> = OnceCell::new();
    static RE_SCENARIOS: OnceCell<Vec<(&'static str, Regex)>> = OnceCell::new();

    let re_rec = RE_RECOMMENDATION.get_or_init(|| {
        Regex::new(r"(?i)Recommendation:\s*([A-Za-z][A-Za-z_/-]*)").expect("recommendation regex")
    });
    let re_conf = RE_CONFIDENCE.get_or_init(|| {
        Regex::new(r"(?i)Confidence Score:\s*([+-]?\d+(?:\.\d+)?)").expect("confidence regex")
    });
    let re_scen = RE_SCENARIOS.get_or_init(|| {
        SCENARIO_NAMES
            .iter()
            .map(|name| {
                let pat = format!(
                    r"(?i)\b{name}\b[^:\n]*:\s*([+-]?\d+(?:\.\d+)?)%[^,\n]*,\s*([+-]?\d+(?:\.\d+)?)%"
                );
                (*name, Regex::new(&pat).expect("scenario regex"))
            })
            .collect()
    });

    // the closing summary comes last; agent chatter may mention the same fields earlier
    let recommendation = re_rec
        .captures_iter(stdout)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    let confidence_score = re_conf
        .captures_iter(stdout)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or_default();

    let mut scenarios = BTreeMap::new();
    for (name, re) in re_scen {
        if let Some(c) = re.captures_iter(stdout).last() {
            let num = |i: usize| {
                c.get(i)
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .unwrap_or_default()
            };
            scenarios.insert(
                name.to_string(),
                Scenario {
                    expected_return: num(1),
                    probability: num(2),
                },
            );
        }
    }

    AnalysisResult {
        recommendation,
        confidence_score,
        scenarios,
        ..AnalysisResult::default()
    }
}

/// Relative memo path announced by the program, if any.
pub fn memo_path(stdout: &str) -> Option<&str> {
    static RE_MEMO: OnceCell<Regex> = OnceCell::new();
    let re = RE_MEMO.get_or_init(|| {
        Regex::new(r"(?m)Investment memo saved to:[ \t]*(.*)$").expect("memo path regex")
    });
    re.captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

/// Best-effort failure message for a non-zero exit.
pub fn exit_message(code: Option<i32>, stdout: &str, stderr: &str) -> String {
    let err_lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if let Some(line) = err_lines
        .iter()
        .rev()
        .find(|l| !TRACEBACK_MARKERS.iter().any(|m| l.contains(m)))
    {
        return line.to_string();
    }
    if !err_lines.is_empty() {
        return err_lines.join("\n");
    }
    if let Some(line) = stdout.lines().map(str::trim).rev().find(|l| {
        let lower = l.to_ascii_lowercase();
        STDOUT_ERROR_WORDS.iter().any(|w| lower.contains(w))
    }) {
        return line.to_string();
    }
    match code {
        Some(c) => format!("Analysis process exited with code {c}"),
        None => "Analysis process terminated by signal".to_string(),
    }
}

/// Reconcile a finished job into a result or a failure.
pub fn resolve(output: JobOutput, project_root: &Path) -> Result<AnalysisResult, JobError> {
    let JobOutput {
        exit_code,
        stdout,
        stderr,
        progress,
    } = output;

    if exit_code != Some(0) {
        let message = exit_message(exit_code, &stdout, &stderr);
        warn!(target: "resolver", code = ?exit_code, %message, "analysis exited with failure");
        return Err(JobError::ProcessExit {
            code: exit_code,
            message,
        });
    }

    let mut parse_error = None;
    let mut structured = None;
    for (name, strategy) in STRUCTURED_STRATEGIES {
        match strategy(&stdout) {
            Extraction::Parsed(r) => {
                debug!(target: "resolver", strategy = name, "structured output parsed");
                structured = Some(r);
                break;
            }
            Extraction::Malformed(e) => {
                warn!(target: "resolver", strategy = name, error = %e, "malformed structured output, scraping text");
                counter!("analysis_parse_fallbacks_total").increment(1);
                parse_error = Some(e);
                break;
            }
            Extraction::NotFound => continue,
        }
    }

    let mut result = structured.unwrap_or_else(|| extract_from_text(&stdout));
    result.parse_error = parse_error;

    if let Some(rel) = memo_path(&stdout) {
        let path = project_root.join(rel);
        match fs::read_to_string(&path) {
            Ok(memo) => result.memo = memo,
            Err(e) => {
                debug!(target: "resolver", path = %path.display(), error = %e, "memo file not readable")
            }
        }
    }

    result.progress_messages = progress;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(stdout: &str) -> JobOutput {
        JobOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..JobOutput::default()
        }
    }

    const TEXT_SUMMARY: &str = "\
ANALYSIS COMPLETE
Recommendation: HOLD
Confidence Score: 0.65

Scenarios:
  Bull: +18.5% return, 25% probability
  Base: +6.0% return, 50% probability
  Bear: -12.3% return, 25% probability
";

    #[test]
    fn sentinel_json_is_preferred() {
        let stdout = "noise\n===JSON_OUTPUT_START===\n{\"recommendation\":\"BUY\",\"confidence_score\":0.8,\"scenarios\":{}}\n===JSON_OUTPUT_END===\n";
        let r = resolve(ok(stdout), Path::new(".")).unwrap();
        assert_eq!(r.recommendation, "BUY");
        assert!((r.confidence_score - 0.8).abs() < 1e-9);
        assert!(r.parse_error.is_none());
    }

    #[test]
    fn bare_json_parses_like_sentinel() {
        let stdout = "[Memo Writer Agent] done\n{\"recommendation\":\"BUY\",\"confidence_score\":0.8,\"scenarios\":{\"bull\":{\"return\":0.2,\"prob\":0.3}}}\nbye\n";
        let r = resolve(ok(stdout), Path::new(".")).unwrap();
        assert_eq!(r.recommendation, "BUY");
        assert_eq!(
            r.scenarios.get("bull"),
            Some(&Scenario {
                expected_return: 0.2,
                probability: 0.3
            })
        );
        assert!(r.parse_error.is_none());
    }

    #[test]
    fn malformed_sentinel_json_falls_back_and_records_error() {
        let stdout = format!(
            "{TEXT_SUMMARY}\n===JSON_OUTPUT_START===\n{{\"recommendation\": \"BUY\",\n===JSON_OUTPUT_END===\n"
        );
        let r = resolve(ok(&stdout), Path::new(".")).unwrap();
        assert_eq!(r.recommendation, "HOLD");
        assert!(r.parse_error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[test]
    fn null_scenario_number_reads_as_zero_and_keeps_payload() {
        let stdout = "===JSON_OUTPUT_START===\n{\"recommendation\":\"BUY\",\"confidence_score\":0.7,\"scenarios\":{\"bull\":{\"return\":null,\"prob\":0.3}},\"market_data\":{\"price\":1}}\n===JSON_OUTPUT_END===\n";
        let r = resolve(ok(stdout), Path::new(".")).unwrap();
        assert_eq!(r.recommendation, "BUY");
        assert!(r.parse_error.is_none());
        assert_eq!(
            r.scenarios["bull"],
            Scenario {
                expected_return: 0.0,
                probability: 0.3
            }
        );
        assert_eq!(r.market_data, Some(serde_json::json!({ "price": 1 })));
    }

    #[test]
    fn non_object_scenario_entries_are_skipped() {
        let stdout = "===JSON_OUTPUT_START===\n{\"recommendation\":\"SELL\",\"scenarios\":{\"bear\":{\"return\":-0.1,\"probability\":0.4},\"summary\":\"upside skew\"},\"timing\":{\"total_time\":2}}\n===JSON_OUTPUT_END===\n";
        let r = resolve(ok(stdout), Path::new(".")).unwrap();
        assert_eq!(r.recommendation, "SELL");
        assert!(r.parse_error.is_none());
        assert_eq!(r.scenarios.len(), 1);
        assert!((r.scenarios["bear"].expected_return + 0.1).abs() < 1e-9);
        assert_eq!(r.timing, Some(serde_json::json!({ "total_time": 2 })));
    }

    #[test]
    fn wrongly_typed_fields_fall_back_to_defaults() {
        let v = serde_json::json!({
            "recommendation": 3,
            "confidence_score": "0.55",
            "memo": null,
            "scenarios": ["bull"],
        });
        let r = AnalysisResult::from_payload(&v);
        assert_eq!(r.recommendation, "");
        assert!((r.confidence_score - 0.55).abs() < 1e-9);
        assert_eq!(r.memo, "");
        assert!(r.scenarios.is_empty());
    }

    #[test]
    fn malformed_bare_json_falls_back_and_records_error() {
        let stdout = format!("{TEXT_SUMMARY}Response text: {{'recommendation': 'BUY'}}\n");
        let r = resolve(ok(&stdout), Path::new(".")).unwrap();
        assert_eq!(r.recommendation, "HOLD");
        assert_eq!(r.scenarios.len(), 3);
        assert!(r.parse_error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[test]
    fn text_scraping_takes_the_closing_summary() {
        let stdout = format!(
            "[Risk Agent] draft Recommendation: BUY\nConfidence Score: 0.2\n  Bull: +40% return, 60% probability\n{TEXT_SUMMARY}"
        );
        let r = extract_from_text(&stdout);
        assert_eq!(r.recommendation, "HOLD");
        assert!((r.confidence_score - 0.65).abs() < 1e-9);
        assert!((r.scenarios["bull"].expected_return - 18.5).abs() < 1e-9);
    }

    #[test]
    fn text_scraping_reads_summary() {
        let r = extract_from_text(TEXT_SUMMARY);
        assert_eq!(r.recommendation, "HOLD");
        assert!((r.confidence_score - 0.65).abs() < 1e-9);
        assert_eq!(r.scenarios.len(), 3);
        let bear = r.scenarios["bear"];
        assert!((bear.expected_return + 12.3).abs() < 1e-9);
        assert!((bear.probability - 25.0).abs() < 1e-9);
    }

    #[test]
    fn text_scraping_defaults_when_absent() {
        let r = extract_from_text("nothing useful here");
        assert_eq!(r.recommendation, "");
        assert_eq!(r.confidence_score, 0.0);
        assert!(r.scenarios.is_empty());
        assert!(matches!(extract_sentinel_json("no markers"), Extraction::NotFound));
        assert!(matches!(extract_bare_json("no braces"), Extraction::NotFound));
    }

    #[test]
    fn memo_file_overrides_json_memo() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("outputs")).unwrap();
        std::fs::write(tmp.path().join("outputs/AAPL_memo.md"), "# AAPL memo\nBuy it.").unwrap();

        let stdout = "Investment memo saved to: outputs/AAPL_memo.md\n===JSON_OUTPUT_START===\n{\"recommendation\":\"BUY\",\"memo\":\"inline\"}\n===JSON_OUTPUT_END===\n";
        let r = resolve(ok(stdout), tmp.path()).unwrap();
        assert_eq!(r.memo, "# AAPL memo\nBuy it.");
    }

    #[test]
    fn unreadable_memo_keeps_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        let stdout = "Investment memo saved to: outputs/MSFT_memo.md\n{\"memo\":\"inline\"}\n";
        let r = resolve(ok(stdout), tmp.path()).unwrap();
        assert_eq!(r.memo, "inline");
        assert_eq!(memo_path(stdout), Some("outputs/MSFT_memo.md"));
    }

    #[test]
    fn memo_path_stays_on_its_line() {
        assert_eq!(memo_path("Investment memo saved to:\nRecommendation: BUY\n"), None);
        assert_eq!(memo_path("Investment memo saved to: \t\nnext line\n"), None);
        assert_eq!(
            memo_path("Investment memo saved to: outputs/X_memo.md  \r\nbye\n"),
            Some("outputs/X_memo.md")
        );
    }

    #[test]
    fn progress_transcript_is_attached() {
        let mut out = ok(TEXT_SUMMARY);
        out.progress = vec![ProgressEvent {
            step: "system".into(),
            message: "hello".into(),
            timestamp: 1,
        }];
        let r = resolve(out, Path::new(".")).unwrap();
        assert_eq!(r.progress_messages.len(), 1);
    }

    #[test]
    fn failure_message_skips_traceback_lines() {
        let out = JobOutput {
            exit_code: Some(1),
            stderr: "Traceback (most recent call last):\n  File \"main.py\", line 3\nValueError: bad ticker\n".into(),
            ..JobOutput::default()
        };
        match resolve(out, Path::new(".")) {
            Err(JobError::ProcessExit { code, message }) => {
                assert_eq!(code, Some(1));
                assert_eq!(message, "ValueError: bad ticker");
            }
            other => panic!("expected ProcessExit, got {other:?}"),
        }
    }

    #[test]
    fn failure_message_fallbacks() {
        assert_eq!(
            exit_message(Some(2), "", "Traceback (most recent call last):\n"),
            "Traceback (most recent call last):"
        );
        assert_eq!(
            exit_message(Some(1), "starting\nError: horizon must be one of [...]\nbye\n", ""),
            "Error: horizon must be one of [...]"
        );
        assert_eq!(exit_message(Some(3), "all quiet", ""), "Analysis process exited with code 3");
        assert_eq!(exit_message(None, "", ""), "Analysis process terminated by signal");
    }
}
