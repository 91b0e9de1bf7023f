//! Web 工具：web_search（Brave Search API）与 web_fetch（抓取网页并提取可读文本）
//!
//! web_fetch 只接受 http(s) URL；HTML 响应用 html2text 提取文本，超过 max_chars 时截断。
//! web_search 未配置 API Key 时直接返回错误文本，不发请求。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::WebSection;
use crate::tools::{Tool, ToolContext};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_2) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const MAX_REDIRECTS: usize = 5;

fn http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .unwrap_or_default()
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start().to_lowercase();
    s.starts_with("<!doctype") || s.starts_with("<html")
}

fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

/// 只允许 http / https 且带主机名
fn validate_url(url: &str) -> Result<reqwest::Url, String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("URL validation failed: {}", e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(format!(
                "URL validation failed: Only http/https allowed, got '{}'",
                other
            ))
        }
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err("URL validation failed: Missing domain".to_string());
    }
    Ok(parsed)
}

/// web_fetch 工具
pub struct WebFetchTool {
    client: Client,
    max_chars: usize,
}

impl WebFetchTool {
    pub fn new(cfg: &WebSection) -> Self {
        Self {
            client: http_client(cfg.timeout_secs),
            max_chars: cfg.max_chars,
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch URL and extract readable content (HTML to text)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL to fetch"},
                "maxChars": {"type": "integer", "minimum": 100}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let url = args.get("url").and_then(Value::as_str).unwrap_or("");
        let max_chars = args
            .get("maxChars")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_chars);
        let parsed = validate_url(url)?;
        tracing::info!(url = %url, "web_fetch tool execute");

        let resp = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.contains("application/json"));
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Read body: {}", e))?;
        let body = body.trim_start_matches('\u{FEFF}');

        let (text, extractor) = if is_json {
            (body.to_string(), "json")
        } else if looks_like_html(body) {
            (html_to_text(body), "html2text")
        } else {
            (body.to_string(), "raw")
        };

        let length = text.chars().count();
        let truncated = length > max_chars;
        let text = if truncated {
            text.chars().take(max_chars).collect::<String>()
        } else {
            text
        };

        Ok(json!({
            "url": url,
            "finalUrl": final_url,
            "status": status,
            "extractor": extractor,
            "truncated": truncated,
            "length": text.chars().count(),
            "text": text,
        })
        .to_string())
    }
}

#[derive(Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: Option<String>,
}

/// web_search 工具
pub struct WebSearchTool {
    client: Client,
    api_key: Option<String>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(cfg: &WebSection) -> Self {
        let api_key = cfg
            .search_api_key
            .clone()
            .or_else(|| std::env::var("BRAVE_API_KEY").ok())
            .filter(|k| !k.is_empty());
        Self {
            client: http_client(cfg.timeout_secs),
            api_key,
            max_results: cfg.max_results.clamp(1, 10),
        }
    }
}

fn format_results(query: &str, results: &[BraveResult]) -> String {
    if results.is_empty() {
        return format!("No results for: {}", query);
    }
    let mut lines = vec![format!("Results for: {}\n", query)];
    for (i, r) in results.iter().enumerate() {
        lines.push(format!("{}. {}\n   {}", i + 1, r.title, r.url));
        if let Some(desc) = r.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("   {}", desc));
        }
    }
    lines.join("\n")
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "count": {"type": "integer", "description": "Results (1-10)", "minimum": 1, "maximum": 10}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let Some(api_key) = &self.api_key else {
            return Err("BRAVE_API_KEY not configured".to_string());
        };
        let query = args.get("query").and_then(Value::as_str).unwrap_or("");
        let count = args
            .get("count")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_results)
            .clamp(1, 10);
        tracing::info!(query = %query, "web_search tool execute");

        let resp = self
            .client
            .get(BRAVE_ENDPOINT)
            .query(&[("q", query.to_string()), ("count", count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("Search failed: HTTP {}", resp.status()));
        }
        let parsed: BraveResponse = resp
            .json()
            .await
            .map_err(|e| format!("Invalid search response: {}", e))?;
        let results: Vec<BraveResult> = parsed
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(count)
            .collect();
        Ok(format_results(query, &results))
    }
}
