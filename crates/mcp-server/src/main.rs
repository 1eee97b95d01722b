use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keepsake_knowledge::{
    Actor, Embedder, EntryId, HashingEmbedder, Intent, KnowledgeBase, NewEntry, RankingConfig,
    SearchOptions,
};
use serde_json::{json, Value as JsonValue};
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_TEXT_BYTES: usize = 32 * 1024; // 32 KiB
const MAX_QUERY_BYTES: usize = 8 * 1024; // 8 KiB
const MAX_TAGS: usize = 32;
const MAX_ITEMS: usize = 200;
const MAX_SEARCH_LIMIT: usize = 200;

/// Startup settings, all from `KEEPSAKE_*` environment variables.
#[derive(Debug, Clone)]
struct Settings {
    db_path: String,
    account_id: String,
    user_id: String,
    user_name: String,
    embedder: String,
    ranking: RankingConfig,
}

impl Settings {
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let or = |key: &str, default: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let mut ranking = RankingConfig::default();
        if let Some(raw) = get("KEEPSAKE_TEMPORAL_WEIGHT") {
            ranking.temporal_weight = raw
                .trim()
                .parse()
                .with_context(|| format!("KEEPSAKE_TEMPORAL_WEIGHT is not a number: {raw:?}"))?;
        }
        if let Some(raw) = get("KEEPSAKE_SIMILARITY_THRESHOLD") {
            ranking.similarity_threshold = raw.trim().parse().with_context(|| {
                format!("KEEPSAKE_SIMILARITY_THRESHOLD is not a number: {raw:?}")
            })?;
            ranking.relaxed_threshold = ranking.relaxed_threshold.min(ranking.similarity_threshold);
        }
        ranking.validate()?;

        let user_id = or("KEEPSAKE_USER", "local");
        Ok(Self {
            db_path: or("KEEPSAKE_DB_PATH", "./keepsake.db"),
            account_id: or("KEEPSAKE_ACCOUNT", "personal"),
            user_name: or("KEEPSAKE_USER_NAME", &user_id),
            user_id,
            embedder: or("KEEPSAKE_EMBEDDER", "hashing").to_lowercase(),
            ranking,
        })
    }

    fn build_embedder(&self) -> Result<Arc<dyn Embedder>> {
        match self.embedder.as_str() {
            "hashing" => Ok(Arc::new(HashingEmbedder::default())),
            #[cfg(feature = "fastembed")]
            "fastembed" => Ok(Arc::new(keepsake_knowledge::FastEmbedder::new()?)),
            other => anyhow::bail!(
                "unknown KEEPSAKE_EMBEDDER {other:?} (expected \"hashing\"{})",
                if cfg!(feature = "fastembed") { " or \"fastembed\"" } else { "" }
            ),
        }
    }
}

struct AppState {
    kb: KnowledgeBase,
    actor: Actor,
}

impl AppState {
    fn open(settings: &Settings) -> Result<Self> {
        let kb = KnowledgeBase::open(&settings.db_path, settings.build_embedder()?)?
            .with_config(settings.ranking)?;
        let actor = Actor::new(&settings.account_id, &settings.user_id, &settings.user_name);
        actor.validate()?;
        Ok(Self { kb, actor })
    }
}

fn main() -> Result<()> {
    // stdout carries the protocol.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let mut state = AppState::open(&settings).context("failed to open keepsake database")?;
    info!(
        db = settings.db_path.as_str(),
        account = settings.account_id.as_str(),
        embedder = settings.embedder.as_str(),
        "keepsake-mcp ready"
    );

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Bad framing gets a parse error; keep serving.
                warn!(error = %e, "unreadable message");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&mut state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    info!("stdin closed; shutting down");
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &mut AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;
    debug!(method, "request");

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "keepsake-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    warn!(error = %err, "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    let string_list = json!({"type": "array", "items": {"type": "string"}});
    vec![
        json!({
            "name": "remember",
            "description": "Store a note. Dates such as \"next friday\" or \"every Monday\" are resolved; `replaces` (entry id, concept or tag like \"family-reunion\") supersedes an earlier note.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "tags": string_list,
                    "intent": {"type": "string", "enum": ["create", "update", "delete", "purchase", "clear_list"]},
                    "replaces": {"type": "string"},
                    "timestamp": {"type": "string", "description": "RFC 3339 or YYYY-MM-DD event time"},
                    "items": string_list,
                    "list_type": {"type": "string"}
                },
                "required": ["content"]
            }
        }),
        json!({
            "name": "search",
            "description": "Find current notes by meaning, with synonyms and date relevance.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "tags": string_list,
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_SEARCH_LIMIT},
                    "at": {"type": "string", "description": "RFC 3339 evaluation instant"}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "purchase",
            "description": "Record bought items and remove them from the shopping list.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "items": string_list,
                    "tags": string_list
                },
                "required": ["items"]
            }
        }),
        json!({
            "name": "clear_list",
            "description": "Clear a shopping list (\"all\" clears every list).",
            "inputSchema": {
                "type": "object",
                "properties": { "list_type": {"type": "string"} }
            }
        }),
        json!({
            "name": "active_items",
            "description": "List the current shopping-list entries.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "history",
            "description": "Every version of a note, oldest first.",
            "inputSchema": {
                "type": "object",
                "properties": { "entry_id": {"type": "string"} },
                "required": ["entry_id"]
            }
        }),
        json!({
            "name": "forget",
            "description": "Permanently delete a note.",
            "inputSchema": {
                "type": "object",
                "properties": { "entry_id": {"type": "string"} },
                "required": ["entry_id"]
            }
        }),
    ]
}

fn call_tool(state: &mut AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    let account = state.actor.account_id.clone();

    match name {
        "remember" => {
            let content = required_str(&args, "content")?;
            if content.len() > MAX_TEXT_BYTES {
                anyhow::bail!("content exceeds max allowed size ({} bytes)", MAX_TEXT_BYTES);
            }
            let mut input = NewEntry::new(content).with_tags(string_list(&args, "tags", MAX_TAGS)?);
            if let Some(intent) = args.get("intent").and_then(JsonValue::as_str) {
                input = input.with_intent(intent.parse::<Intent>()?);
            }
            if let Some(replaces) = args.get("replaces").and_then(JsonValue::as_str) {
                input = input.replacing(replaces);
            }
            if let Some(ts) = args.get("timestamp").and_then(JsonValue::as_str) {
                input = input.at(ts);
            }
            let items = string_list(&args, "items", MAX_ITEMS)?;
            if !items.is_empty() {
                input = input.with_items(items);
            }
            if let Some(list_type) = args.get("list_type").and_then(JsonValue::as_str) {
                input = input.with_list_type(list_type);
            }

            let id = state.kb.process_and_store(&state.actor, input)?;
            let entry = state.kb.get_entry(&account, &id)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("stored entry {id}") }],
                "structuredContent": { "entry_id": id.as_str(), "entry": entry }
            }))
        }
        "search" => {
            let query = required_str(&args, "query")?;
            if query.len() > MAX_QUERY_BYTES {
                anyhow::bail!("query exceeds max allowed size ({} bytes)", MAX_QUERY_BYTES);
            }
            let limit = args.get("limit").and_then(JsonValue::as_u64).unwrap_or(10) as usize;
            if limit == 0 || limit > MAX_SEARCH_LIMIT {
                anyhow::bail!("limit must be within 1..={MAX_SEARCH_LIMIT}");
            }
            let mut options = SearchOptions::default().limit(limit);
            if let Some(at) = args.get("at").and_then(JsonValue::as_str) {
                let at: DateTime<Utc> = at.parse().context("at must be RFC3339")?;
                options = options.at(at);
            }
            let tags = string_list(&args, "tags", MAX_TAGS)?;
            let tags = (!tags.is_empty()).then_some(tags);

            let results = state.kb.search(&account, query, tags.as_deref(), &options)?;
            let text = if results.is_empty() {
                "no matching notes".to_string()
            } else {
                results
                    .iter()
                    .map(|r| match r.temporal_context.as_str() {
                        "" => format!("- {} ({:.2})", r.entry.content, r.combined_score),
                        ctx => format!("- {} ({:.2}; {ctx})", r.entry.content, r.combined_score),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "structuredContent": { "results": results }
            }))
        }
        "purchase" => {
            let items = string_list(&args, "items", MAX_ITEMS)?;
            let tags = string_list(&args, "tags", MAX_TAGS)?;
            let outcome = state.kb.handle_purchase(&state.actor, &items, &tags)?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "purchase recorded; {} list entr{} updated",
                        outcome.superseded.len(),
                        if outcome.superseded.len() == 1 { "y" } else { "ies" }
                    )
                }],
                "structuredContent": outcome
            }))
        }
        "clear_list" => {
            let list_type = args
                .get("list_type")
                .and_then(JsonValue::as_str)
                .unwrap_or("shopping");
            let outcome = state.kb.clear_list(&state.actor, list_type)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("cleared {} entr{}", outcome.superseded.len(), if outcome.superseded.len() == 1 { "y" } else { "ies" }) }],
                "structuredContent": outcome
            }))
        }
        "active_items" => {
            let entries = state.kb.get_active_items(&account)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} active list entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" }) }],
                "structuredContent": { "entries": entries }
            }))
        }
        "history" => {
            let id = EntryId::from(required_str(&args, "entry_id")?);
            let chain = state.kb.revision_history(&account, &id)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} version(s) of {}", chain.len(), chain.concept()) }],
                "structuredContent": {
                    "concept": chain.concept(),
                    "current": chain.current().map(|e| e.id.as_str()),
                    "entries": chain.history()
                }
            }))
        }
        "forget" => {
            let id = EntryId::from(required_str(&args, "entry_id")?);
            state.kb.delete_entry(&account, &id)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("deleted entry {id}") }],
                "structuredContent": { "entry_id": id.as_str() }
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn required_str<'a>(args: &'a JsonValue, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(JsonValue::as_str)
        .with_context(|| format!("{key} is required"))
}

/// Optional array of strings; absent or null is empty.
fn string_list(args: &JsonValue, key: &str, max: usize) -> Result<Vec<String>> {
    let Some(value) = args.get(key).filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let list = value
        .as_array()
        .with_context(|| format!("{key} must be an array of strings"))?;
    if list.len() > max {
        anyhow::bail!("{key} exceeds max allowed length ({max})");
    }
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .with_context(|| format!("{key} must be an array of strings"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn temp_state() -> (AppState, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let settings = Settings {
            db_path: file.path().to_string_lossy().to_string(),
            ..Settings::from_lookup(|_| None).unwrap()
        };
        (AppState::open(&settings).unwrap(), file)
    }

    fn call(state: &mut AppState, name: &str, arguments: JsonValue) -> Result<JsonValue> {
        call_tool(state, Some(&json!({ "name": name, "arguments": arguments })))
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let defaults = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(defaults.db_path, "./keepsake.db");
        assert_eq!(defaults.account_id, "personal");
        assert_eq!(defaults.user_name, "local");
        assert_eq!(defaults.ranking, RankingConfig::default());

        let vars: HashMap<&str, &str> = [
            ("KEEPSAKE_ACCOUNT", "family"),
            ("KEEPSAKE_TEMPORAL_WEIGHT", "0.4"),
            ("KEEPSAKE_SIMILARITY_THRESHOLD", "0.1"),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.account_id, "family");
        assert_eq!(s.ranking.temporal_weight, 0.4);
        assert_eq!(s.ranking.similarity_threshold, 0.1);
        assert!(s.ranking.relaxed_threshold <= 0.1);
    }

    #[test]
    fn settings_reject_bad_numbers() {
        let err = Settings::from_lookup(|k| {
            (k == "KEEPSAKE_TEMPORAL_WEIGHT").then(|| "heavy".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("KEEPSAKE_TEMPORAL_WEIGHT"));
        assert!(Settings::from_lookup(|k| {
            (k == "KEEPSAKE_TEMPORAL_WEIGHT").then(|| "1.5".to_string())
        })
        .is_err());
    }

    #[test]
    fn remember_then_search() {
        let (mut state, _file) = temp_state();
        call(
            &mut state,
            "remember",
            json!({ "content": "Dentist appointment next friday", "tags": ["health"] }),
        )
        .unwrap();

        let out = call(&mut state, "search", json!({ "query": "dentist", "limit": 5 })).unwrap();
        let results = out["structuredContent"]["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["entry"]["content"], "Dentist appointment next friday");
    }

    #[test]
    fn purchase_then_active_items() {
        let (mut state, _file) = temp_state();
        call(
            &mut state,
            "remember",
            json!({ "content": "Need milk, eggs and bread", "tags": ["shopping"] }),
        )
        .unwrap();
        let out = call(&mut state, "purchase", json!({ "items": ["eggs"] })).unwrap();
        assert_eq!(out["structuredContent"]["superseded"].as_array().unwrap().len(), 1);

        let active = call(&mut state, "active_items", json!({})).unwrap();
        let entries = active["structuredContent"]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["items"], json!(["milk", "bread"]));
    }

    #[test]
    fn update_shows_in_history_and_forget_deletes() {
        let (mut state, _file) = temp_state();
        let first = call(
            &mut state,
            "remember",
            json!({ "content": "Reunion is June 14", "tags": ["family", "reunion"] }),
        )
        .unwrap();
        let first_id = first["structuredContent"]["entry_id"].as_str().unwrap().to_string();
        let second = call(
            &mut state,
            "remember",
            json!({
                "content": "We moved the family reunion to July 9",
                "tags": ["family", "reunion"],
                "replaces": "family-reunion"
            }),
        )
        .unwrap();
        let second_id = second["structuredContent"]["entry_id"].as_str().unwrap().to_string();

        let history = call(&mut state, "history", json!({ "entry_id": first_id })).unwrap();
        assert_eq!(history["structuredContent"]["entries"].as_array().unwrap().len(), 2);
        assert_eq!(history["structuredContent"]["current"], json!(second_id));

        call(&mut state, "forget", json!({ "entry_id": second_id })).unwrap();
        assert!(call(&mut state, "forget", json!({ "entry_id": second_id })).is_err());
    }

    #[test]
    fn rejects_bad_arguments() {
        let (mut state, _file) = temp_state();
        assert!(call(&mut state, "remember", json!({})).is_err());
        assert!(call(&mut state, "remember", json!({ "content": "x", "tags": "solo" })).is_err());
        let huge = "a".repeat(MAX_TEXT_BYTES + 1);
        let err = call(&mut state, "remember", json!({ "content": huge })).unwrap_err();
        assert!(err.to_string().contains("content exceeds max"));
        let err = call(
            &mut state,
            "search",
            json!({ "query": "x", "limit": MAX_SEARCH_LIMIT + 1 }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("limit must be within"));
        assert!(call(&mut state, "nope", json!({})).is_err());
    }

    #[test]
    fn read_message_rejects_oversized_frame() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(raw.into_bytes());
        let err = read_message(&mut cursor).expect_err("oversized frame must fail");
        assert!(err.to_string().contains("exceeds max allowed"));
    }

    #[test]
    fn unknown_method_is_json_rpc_error() {
        let (mut state, _file) = temp_state();
        let resp = handle_request(&mut state, &json!({ "jsonrpc": "2.0", "id": 7, "method": "x" }))
            .unwrap();
        assert_eq!(resp["error"]["code"], -32601);
        assert!(handle_request(
            &mut state,
            &json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
        )
        .is_none());
    }
}
