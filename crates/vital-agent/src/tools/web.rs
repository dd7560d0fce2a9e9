//! The `web_search` tool: DuckDuckGo instant answers + Wikipedia opensearch +
//! PubMed eutils, merged and deduped, with a per-upstream circuit breaker and
//! a TTL'd result cache in the store.
//!
//! Handlers use the blocking HTTP client; the orchestrator runs this tool on
//! a worker thread (`spawn_blocking`).

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{arg_i64, require_str, ToolContext, ToolError, ToolRegistry, ToolResult, ToolSpec};

const USER_AGENT: &str = "VitalCoach/0.3";

struct CircuitState {
    failures: u32,
    open_until: Option<Instant>,
}

static CIRCUITS: LazyLock<Mutex<HashMap<&'static str, CircuitState>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn circuit_allows(name: &'static str) -> bool {
    let mut circuits = CIRCUITS.lock().unwrap();
    let state = circuits.entry(name).or_insert(CircuitState {
        failures: 0,
        open_until: None,
    });
    match state.open_until {
        Some(until) if Instant::now() < until => false,
        _ => true,
    }
}

fn circuit_record(name: &'static str, ok: bool, threshold: u32, open_secs: u64) {
    let mut circuits = CIRCUITS.lock().unwrap();
    let state = circuits.entry(name).or_insert(CircuitState {
        failures: 0,
        open_until: None,
    });
    if ok {
        state.failures = 0;
        state.open_until = None;
    } else {
        state.failures += 1;
        if state.failures >= threshold.max(1) {
            state.open_until = Some(Instant::now() + Duration::from_secs(open_secs.max(5)));
        }
    }
}

fn run_with_circuit<T>(
    name: &'static str,
    threshold: u32,
    open_secs: u64,
    f: impl FnOnce() -> Result<T, String>,
) -> Result<T, String> {
    if !circuit_allows(name) {
        return Err(format!("{name} circuit_open"));
    }
    match f() {
        Ok(out) => {
            circuit_record(name, true, threshold, open_secs);
            Ok(out)
        }
        Err(e) => {
            circuit_record(name, false, threshold, open_secs);
            Err(e)
        }
    }
}

fn query_key(query: &str, max_results: usize) -> String {
    let raw = format!("{}::{}", query.trim().to_lowercase(), max_results);
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn http_get_json(url: &str, timeout_s: u64) -> Result<Value, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_s.max(2)))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| e.to_string())?;
    let resp = client.get(url).send().map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("status {}", resp.status().as_u16()));
    }
    resp.json().map_err(|e| e.to_string())
}

fn result_row(title: &str, url: &str, snippet: &str, source: &str) -> Value {
    json!({
        "title": title,
        "url": url,
        "snippet": snippet,
        "source": source,
    })
}

fn ddg_instant_search(query: &str, max_results: usize, timeout_s: u64) -> Result<Vec<Value>, String> {
    let url = format!(
        "https://api.duckduckgo.com/?q={}&format=json&no_html=1&skip_disambig=1",
        urlencoding::encode(query)
    );
    let data = http_get_json(&url, timeout_s)?;

    let mut results: Vec<Value> = Vec::new();
    let abstract_text = data["AbstractText"].as_str().unwrap_or("").trim();
    let abstract_url = data["AbstractURL"].as_str().unwrap_or("").trim();
    let heading = data["Heading"].as_str().unwrap_or("").trim();
    if !abstract_text.is_empty() && !abstract_url.is_empty() {
        let title = if heading.is_empty() {
            "DuckDuckGo Instant Answer"
        } else {
            heading
        };
        results.push(result_row(title, abstract_url, abstract_text, "duckduckgo"));
    }

    fn push_topic(results: &mut Vec<Value>, topic: &Value, max_results: usize) {
        if results.len() >= max_results {
            return;
        }
        let text = topic["Text"].as_str().unwrap_or("").trim();
        let url = topic["FirstURL"].as_str().unwrap_or("").trim();
        if !text.is_empty() && !url.is_empty() {
            let title: String = text.split(" - ").next().unwrap_or(text).chars().take(120).collect();
            let snippet: String = text.chars().take(320).collect();
            results.push(result_row(&title, url, &snippet, "duckduckgo"));
        }
    }

    if let Some(related) = data["RelatedTopics"].as_array() {
        for topic in related {
            if results.len() >= max_results {
                break;
            }
            if let Some(children) = topic["Topics"].as_array() {
                for child in children {
                    if results.len() >= max_results {
                        break;
                    }
                    push_topic(&mut results, child, max_results);
                }
            } else {
                push_topic(&mut results, topic, max_results);
            }
        }
    }

    results.truncate(max_results);
    Ok(results)
}

fn wikipedia_open_search(query: &str, max_results: usize, timeout_s: u64) -> Result<Vec<Value>, String> {
    let url = format!(
        "https://en.wikipedia.org/w/api.php?action=opensearch&search={}&limit={}&namespace=0&format=json",
        urlencoding::encode(query),
        max_results
    );
    let data = http_get_json(&url, timeout_s)?;
    let Some(arr) = data.as_array().filter(|a| a.len() >= 4) else {
        return Ok(Vec::new());
    };
    let titles = arr[1].as_array().cloned().unwrap_or_default();
    let descs = arr[2].as_array().cloned().unwrap_or_default();
    let urls = arr[3].as_array().cloned().unwrap_or_default();

    let mut out = Vec::new();
    for (i, title) in titles.iter().enumerate() {
        if out.len() >= max_results {
            break;
        }
        let t = title.as_str().unwrap_or("").trim();
        let u = urls.get(i).and_then(Value::as_str).unwrap_or("").trim();
        let d = descs.get(i).and_then(Value::as_str).unwrap_or("").trim();
        if t.is_empty() || u.is_empty() {
            continue;
        }
        let snippet: String = d.chars().take(320).collect();
        out.push(result_row(t, u, &snippet, "wikipedia"));
    }
    Ok(out)
}

fn pubmed_search(query: &str, max_results: usize, timeout_s: u64) -> Result<Vec<Value>, String> {
    let search_url = format!(
        "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi?db=pubmed&retmode=json&retmax={}&sort=relevance&term={}",
        max_results,
        urlencoding::encode(query)
    );
    let search_data = http_get_json(&search_url, timeout_s)?;
    let ids: Vec<String> = search_data["esearchresult"]["idlist"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let summary_url = format!(
        "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esummary.fcgi?db=pubmed&retmode=json&id={}",
        ids[..ids.len().min(max_results)].join(",")
    );
    let summary_data = http_get_json(&summary_url, timeout_s)?;
    let result_block = &summary_data["result"];

    let mut out = Vec::new();
    for pmid in ids.iter().take(max_results) {
        let item = &result_block[pmid.as_str()];
        let title = item["title"].as_str().unwrap_or("").trim();
        if title.is_empty() {
            continue;
        }
        let journal = item["fulljournalname"].as_str().unwrap_or("").trim();
        let pubdate = item["pubdate"].as_str().unwrap_or("").trim();
        let snippet: String = [journal, pubdate]
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ")
            .chars()
            .take(320)
            .collect();
        out.push(result_row(
            title,
            &format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/"),
            &snippet,
            "pubmed",
        ));
    }
    Ok(out)
}

/// URL-deduping merge, primary results first.
fn merge_results(primary: Vec<Value>, secondary: Vec<Value>, max_results: usize) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for item in primary.into_iter().chain(secondary) {
        let url = item["url"].as_str().unwrap_or("").trim().to_string();
        if url.is_empty() || seen.contains(&url) {
            continue;
        }
        seen.push(url);
        out.push(item);
        if out.len() >= max_results {
            break;
        }
    }
    out
}

fn tool_web_search(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let ws = &ctx.config.web_search;
    if !ws.enable_web_search {
        return Err(ToolError::Validation("Web search is disabled".to_string()));
    }
    if !ws
        .web_search_allowed_specialists
        .iter()
        .any(|s| s == ctx.specialist_id)
        && ctx.specialist_id != "orchestrator"
    {
        return Err(ToolError::NotAllowed {
            tool: "web_search".to_string(),
            specialist: ctx.specialist_id.to_string(),
        });
    }

    let query = require_str(args, "query")?;
    let max_results = arg_i64(args, "max_results")?
        .unwrap_or(ws.web_search_max_results as i64)
        .clamp(1, 10) as usize;

    let key = query_key(query, max_results);
    let cache_cutoff =
        chrono::Utc::now() - chrono::Duration::hours(ws.web_search_cache_ttl_hours.max(1) as i64);
    if let Some(cached) = vital_store::websearch::read_cache(ctx.conn, &key, cache_cutoff)? {
        if let Ok(Value::Array(results)) = serde_json::from_str::<Value>(&cached) {
            let clipped: Vec<Value> = results.into_iter().take(max_results).collect();
            return Ok(json!({ "query": query, "results": clipped, "cached": true }));
        }
    }

    let timeout_s = ws.web_search_timeout_seconds.max(2) as u64;
    let threshold = ws.web_search_circuit_fail_threshold;
    let open_secs = ws.web_search_circuit_open_seconds as u64;
    let mut errors: Vec<String> = Vec::new();

    let ddg = run_with_circuit("duckduckgo", threshold, open_secs, || {
        ddg_instant_search(query, max_results, timeout_s)
    })
    .unwrap_or_else(|e| {
        warn!(error = %e, "duckduckgo search failed");
        errors.push(format!("duckduckgo:{e}"));
        Vec::new()
    });
    let wiki = run_with_circuit("wikipedia", threshold, open_secs, || {
        wikipedia_open_search(query, max_results, timeout_s)
    })
    .unwrap_or_else(|e| {
        warn!(error = %e, "wikipedia search failed");
        errors.push(format!("wikipedia:{e}"));
        Vec::new()
    });
    let pubmed = run_with_circuit("pubmed", threshold, open_secs, || {
        pubmed_search(query, max_results, timeout_s)
    })
    .unwrap_or_else(|e| {
        warn!(error = %e, "pubmed search failed");
        errors.push(format!("pubmed:{e}"));
        Vec::new()
    });

    let results = merge_results(ddg, merge_results(pubmed, wiki, max_results), max_results);
    vital_store::websearch::write_cache(
        ctx.conn,
        &key,
        query,
        "duckduckgo+pubmed+wikipedia",
        &serde_json::to_string(&results)?,
    )?;
    Ok(json!({ "query": query, "results": results, "cached": false, "errors": errors }))
}

pub fn register_web_tools(registry: &mut ToolRegistry) {
    registry.register(
        ToolSpec {
            name: "web_search",
            description: "Search current web information for health-related user questions.",
            required_fields: &["query"],
            read_only: true,
            allowed_specialists: None,
            tags: &["search", "web"],
        },
        tool_web_search,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_keys_are_stable_and_result_scoped() {
        let a = query_key("Magnesium timing", 5);
        let b = query_key("magnesium timing  ", 5);
        let c = query_key("magnesium timing", 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn merge_dedupes_by_url_and_caps() {
        let primary = vec![
            result_row("A", "https://a", "", "duckduckgo"),
            result_row("B", "https://b", "", "duckduckgo"),
        ];
        let secondary = vec![
            result_row("B2", "https://b", "", "wikipedia"),
            result_row("C", "https://c", "", "wikipedia"),
            result_row("D", "https://d", "", "wikipedia"),
        ];
        let merged = merge_results(primary, secondary, 3);
        let urls: Vec<&str> = merged.iter().map(|m| m["url"].as_str().unwrap()).collect();
        assert_eq!(urls, vec!["https://a", "https://b", "https://c"]);
    }

    #[test]
    fn circuit_opens_after_threshold_failures() {
        for _ in 0..3 {
            let failed: Result<(), String> =
                run_with_circuit("test_upstream", 3, 60, || Err("boom".to_string()));
            assert!(failed.is_err());
        }
        let blocked: Result<(), String> = run_with_circuit("test_upstream", 3, 60, || Ok(()));
        assert!(blocked.is_err());
        assert!(blocked.unwrap_err().contains("circuit_open"));
    }
}
