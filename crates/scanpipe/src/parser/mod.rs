use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    error::PipelineError,
    models::{ExtractedFinding, ScanResult},
};

/// Opening braces that never close before extraction gives up.
const MAX_UNCLOSED_STARTS: usize = 64;

/// Returns the first balanced `{...}` span in `text` that parses as a JSON object.
///
/// Braces inside JSON strings are ignored while counting depth. Candidates that
/// balance but fail to parse (log lines like `{pid=12}`) are skipped.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, PipelineError> {
    let mut search_from = 0;
    let mut last_error = None;
    let mut unclosed = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let Some(end) = balanced_end(&text[start..]) else {
            // Unclosed brace; a later one may still open a complete object.
            // Each retry rescans to the end of the text, so retries are capped.
            unclosed += 1;
            if unclosed >= MAX_UNCLOSED_STARTS {
                warn!(unclosed, "too many unclosed braces in output; giving up");
                break;
            }
            search_from = start + 1;
            continue;
        };
        let candidate = &text[start..start + end];
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => {
                if has_further_object(&text[start + end..]) {
                    warn!("worker output contains more than one JSON object; using the first");
                }
                return Ok(map);
            }
            Ok(_) => search_from = start + 1,
            Err(e) => {
                debug!(error = %e, "skipping unparseable brace span");
                last_error = Some(e);
                search_from = start + 1;
            }
        }
    }

    Err(PipelineError::MalformedOutput(match last_error {
        Some(e) => format!("no parseable JSON object in output: {e}"),
        None => "no JSON object in output".to_string(),
    }))
}

/// Byte length of the balanced object starting at `s[0] == '{'`.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in s.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn has_further_object(rest: &str) -> bool {
    let mut from = 0;
    while let Some(offset) = rest[from..].find('{') {
        let start = from + offset;
        match balanced_end(&rest[start..]) {
            Some(end) => {
                if serde_json::from_str::<Value>(&rest[start..start + end]).is_ok() {
                    return true;
                }
                from = start + 1;
            }
            None => return false,
        }
    }
    false
}

/// Extracts the worker payload from stdout and flattens its findings.
///
/// Expected shape: `{ module: { category: [ {type, description, details?} ] } }`.
/// Entries that do not fit the shape are skipped rather than rejected.
pub fn parse_scan_output(stdout: &str) -> Result<ScanResult, PipelineError> {
    let map = extract_json_object(stdout)?;
    let mut findings = Vec::new();

    for (module, categories) in &map {
        let Some(categories) = categories.as_object() else {
            debug!(module = %module, "module entry is not an object; skipping");
            continue;
        };
        for (category, entries) in categories {
            let Some(entries) = entries.as_array() else {
                continue;
            };
            for entry in entries {
                match to_finding(module, category, entry) {
                    Some(finding) => findings.push(finding),
                    None => debug!(module = %module, category = %category, "finding without a `type` tag; skipping"),
                }
            }
        }
    }

    Ok(ScanResult {
        raw: Value::Object(map),
        findings,
    })
}

fn to_finding(module: &str, category: &str, entry: &Value) -> Option<ExtractedFinding> {
    let obj = entry.as_object()?;
    let finding_type = obj.get("type")?.as_str()?.to_string();
    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let details = obj.get("details").filter(|d| !d.is_null()).cloned();

    Some(ExtractedFinding {
        module: module.to_string(),
        category: category.to_string(),
        finding_type,
        description,
        details,
    })
}
