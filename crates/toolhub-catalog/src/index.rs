//! Full-text index over the live tool set.
//!
//! Each tool is indexed over four weighted fields: tool name, server name,
//! description, and the flattened input-schema property names and
//! descriptions. Queries are tokenized, synonym-expanded and matched per
//! term by exact, prefix or bounded-edit-distance lookups against the index
//! vocabulary. Terms combine inclusively; scores are normalized against the
//! best hit.
//!
//! The index only rebuilds when the set of tools changes, as measured by a
//! fingerprint over the sorted tool identities.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use toolhub_mcp::McpToolDefinition;

use crate::category::{categorize, ToolCategory};
use crate::ports::ServerRecord;
use crate::text::{expand_synonyms, levenshtein, max_edits, similarity, tokenize, QueryTerm};

/// Weight of context words relative to query keywords.
const CONTEXT_WEIGHT: f64 = 0.3;
/// Score factor for a vocabulary term that extends the query term.
const PREFIX_FACTOR: f64 = 0.7;
/// Score factor for a fuzzy match, further scaled by similarity.
const FUZZY_FACTOR: f64 = 0.5;
/// Minimum similarity for a tool-name suggestion.
const SUGGESTION_FLOOR: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Server,
    Description,
    Schema,
}

impl Field {
    fn weight(self) -> f64 {
        match self {
            Field::Name => 3.0,
            Field::Server => 2.0,
            Field::Description => 1.0,
            Field::Schema => 0.5,
        }
    }
}

/// One tool on one server, built from live introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecord {
    pub server_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub project_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub annotations: Option<Value>,
}

impl ToolRecord {
    pub fn from_definition(server: &ServerRecord, definition: McpToolDefinition) -> Self {
        Self {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            tool_name: definition.name,
            project_id: server.project_id.clone(),
            title: definition.title,
            description: definition.description,
            input_schema: definition.input_schema,
            output_schema: definition.output_schema,
            annotations: definition.annotations,
        }
    }

    /// Identity of this tool within the index.
    pub fn index_key(&self) -> String {
        format!("{}:{}", self.server_id, self.tool_name)
    }

    pub fn category(&self) -> ToolCategory {
        categorize(&self.server_name, &self.tool_name, self.description.as_deref())
    }
}

/// Property names and descriptions from a JSON schema, nested ones included.
fn schema_text(schema: &Value) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        if let Some(properties) = value.get("properties").and_then(Value::as_object) {
            for (name, property) in properties {
                out.push(name.clone());
                if let Some(description) = property.get("description").and_then(Value::as_str) {
                    out.push(description.to_string());
                }
                walk(property, out);
            }
        }
        if let Some(items) = value.get("items") {
            walk(items, out);
        }
    }

    let mut out = Vec::new();
    walk(schema, &mut out);
    out.join(" ")
}

/// Response verbosity tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    /// Identity only
    Minimal,
    /// Identity, truncated description and relevance
    #[default]
    Summary,
    /// Everything, schemas included
    Full,
}

/// A search query with its filters.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub keywords: Vec<String>,
    pub context: Option<String>,
    /// Server ids to search; `None` searches every server
    pub allowed_servers: Option<HashSet<String>>,
    pub project: Option<String>,
    pub category: Option<ToolCategory>,
    pub max_results: usize,
}

impl SearchQuery {
    pub fn new(keywords: Vec<String>, max_results: usize) -> Self {
        Self {
            keywords,
            max_results,
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn allowed(mut self, servers: HashSet<String>) -> Self {
        self.allowed_servers = Some(servers);
        self
    }

    pub fn in_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    pub fn in_category(mut self, category: Option<ToolCategory>) -> Self {
        self.category = category;
        self
    }

    fn admits(&self, document: &Document) -> bool {
        let record = &document.record;
        if let Some(ref allowed) = self.allowed_servers {
            if !allowed.contains(&record.server_id) {
                return false;
            }
        }
        if let Some(ref project) = self.project {
            if record.project_id.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        self.category.map_or(true, |c| c == document.category)
    }
}

/// A scored search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: ToolRecord,
    pub category: ToolCategory,
    /// Relevance in `(0, 1]`, the best hit scoring 1
    pub score: f64,
}

/// A search result shaped for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTool {
    pub tool_key: String,
    pub server: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ToolCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl SearchHit {
    pub fn shape(&self, tool_key: String, level: DetailLevel, preview_chars: usize) -> DiscoveredTool {
        let record = &self.record;
        let mut tool = DiscoveredTool {
            tool_key,
            server: record.server_name.clone(),
            name: record.tool_name.clone(),
            title: None,
            description: None,
            category: None,
            relevance: None,
            input_schema: None,
            output_schema: None,
            annotations: None,
        };

        match level {
            DetailLevel::Minimal => {}
            DetailLevel::Summary => {
                tool.title = record.title.clone();
                tool.description = record
                    .description
                    .as_deref()
                    .map(|d| preview(d, preview_chars));
                tool.category = Some(self.category);
                tool.relevance = Some(round_score(self.score));
            }
            DetailLevel::Full => {
                tool.title = record.title.clone();
                tool.description = record.description.clone();
                tool.category = Some(self.category);
                tool.relevance = Some(round_score(self.score));
                tool.input_schema = Some(record.input_schema.clone());
                tool.output_schema = record.output_schema.clone();
                tool.annotations = record.annotations.clone();
            }
        }
        tool
    }
}

fn round_score(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

/// First `max_chars` characters of `text`, cut at a word boundary when one
/// is reasonably close.
fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut chars = text.chars();
    let cut: String = chars.by_ref().take(max_chars).collect();
    let at_boundary = chars.next().is_some_and(char::is_whitespace);
    let cut = match cut.rfind(char::is_whitespace) {
        Some(pos) if !at_boundary && pos >= cut.len() / 2 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}...", cut.trim_end())
}

#[derive(Debug)]
struct Document {
    record: ToolRecord,
    category: ToolCategory,
}

#[derive(Debug, Clone, Copy)]
struct Posting {
    doc: usize,
    /// Sum of field weights over every occurrence
    weight: f64,
}

#[derive(Debug, Default)]
struct IndexState {
    fingerprint: String,
    documents: Vec<Document>,
    postings: HashMap<String, Vec<Posting>>,
}

impl IndexState {
    fn build(fingerprint: String, records: Vec<ToolRecord>) -> Self {
        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();
        let mut documents = Vec::with_capacity(records.len());

        for (doc, record) in records.into_iter().enumerate() {
            let mut weights: HashMap<String, f64> = HashMap::new();
            let schema = schema_text(&record.input_schema);
            let fields = [
                (Field::Name, record.tool_name.as_str()),
                (Field::Name, record.title.as_deref().unwrap_or_default()),
                (Field::Server, record.server_name.as_str()),
                (Field::Description, record.description.as_deref().unwrap_or_default()),
                (Field::Schema, schema.as_str()),
            ];
            for (field, text) in fields {
                for token in tokenize(text) {
                    *weights.entry(token).or_default() += field.weight();
                }
            }
            for (term, weight) in weights {
                postings.entry(term).or_default().push(Posting { doc, weight });
            }

            let category = record.category();
            documents.push(Document { record, category });
        }

        Self {
            fingerprint,
            documents,
            postings,
        }
    }

    fn idf(&self, postings: &[Posting]) -> f64 {
        (1.0 + self.documents.len() as f64 / postings.len().max(1) as f64).ln()
    }

    /// How well `vocab` matches query term `query`, if at all.
    fn match_quality(query: &str, vocab: &str) -> Option<f64> {
        if vocab == query {
            return Some(1.0);
        }
        if query.chars().count() >= 2 && vocab.starts_with(query) {
            return Some(PREFIX_FACTOR);
        }
        let edits = max_edits(query);
        if edits == 0 || vocab.len().abs_diff(query.len()) > edits {
            return None;
        }
        if levenshtein(query, vocab) <= edits {
            return Some(FUZZY_FACTOR * similarity(query, vocab));
        }
        None
    }

    /// Adds each admitted document's best match for `term` to `scores`.
    fn score_term(&self, term: &QueryTerm, query: &SearchQuery, scores: &mut HashMap<usize, f64>) {
        let mut best: HashMap<usize, f64> = HashMap::new();
        for (vocab, postings) in &self.postings {
            let Some(quality) = Self::match_quality(&term.text, vocab) else {
                continue;
            };
            let idf = self.idf(postings);
            for posting in postings {
                if !query.admits(&self.documents[posting.doc]) {
                    continue;
                }
                let contribution = term.weight * quality * idf * posting.weight;
                let entry = best.entry(posting.doc).or_default();
                if contribution > *entry {
                    *entry = contribution;
                }
            }
        }
        for (doc, score) in best {
            *scores.entry(doc).or_default() += score;
        }
    }
}

/// Tool index over the current tool set.
#[derive(Debug, Default)]
pub struct ToolIndex {
    state: RwLock<IndexState>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of a tool set: sorted tool identities, joined.
    pub fn fingerprint(records: &[ToolRecord]) -> String {
        let mut keys: Vec<String> = records.iter().map(ToolRecord::index_key).collect();
        keys.sort();
        keys.join("\n")
    }

    /// Rebuild from `records` if the tool set changed. Returns whether a
    /// rebuild happened.
    pub fn refresh(&self, records: Vec<ToolRecord>) -> bool {
        let fingerprint = Self::fingerprint(&records);
        if self.state.read().fingerprint == fingerprint && !self.state.read().documents.is_empty() {
            return false;
        }

        let count = records.len();
        let state = IndexState::build(fingerprint, records);
        debug!(tools = count, terms = state.postings.len(), "Rebuilt tool index");
        *self.state.write() = state;
        true
    }

    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fingerprint_of_current(&self) -> String {
        self.state.read().fingerprint.clone()
    }

    pub fn get(&self, server_id: &str, tool_name: &str) -> Option<ToolRecord> {
        self.state
            .read()
            .documents
            .iter()
            .find(|d| d.record.server_id == server_id && d.record.tool_name == tool_name)
            .map(|d| d.record.clone())
    }

    /// Ranked matches for `query`, best first.
    pub fn search(&self, query: &SearchQuery) -> Vec<SearchHit> {
        let tokens: Vec<String> = query.keywords.iter().flat_map(|k| tokenize(k)).collect();
        let mut terms = expand_synonyms(&tokens);
        if let Some(ref context) = query.context {
            for token in tokenize(context) {
                if !terms.iter().any(|t| t.text == token) {
                    terms.push(QueryTerm {
                        text: token,
                        weight: CONTEXT_WEIGHT,
                    });
                }
            }
        }
        if terms.is_empty() {
            return Vec::new();
        }

        let state = self.state.read();
        let mut scores: HashMap<usize, f64> = HashMap::new();
        for term in &terms {
            state.score_term(term, query, &mut scores);
        }

        let mut ranked: Vec<(usize, f64)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then_with(|| {
                let (ra, rb) = (&state.documents[a.0].record, &state.documents[b.0].record);
                (&ra.server_name, &ra.tool_name).cmp(&(&rb.server_name, &rb.tool_name))
            })
        });

        let top = ranked.first().map(|(_, s)| *s).unwrap_or(1.0);
        ranked
            .into_iter()
            .take(query.max_results)
            .map(|(doc, score)| {
                let document = &state.documents[doc];
                SearchHit {
                    record: document.record.clone(),
                    category: document.category,
                    score: score / top,
                }
            })
            .collect()
    }

    /// Tools on `server_id` whose names resemble `tool_name`, closest first.
    pub fn similar_tools(&self, server_id: &str, tool_name: &str, limit: usize) -> Vec<ToolRecord> {
        let wanted = tool_name.to_lowercase();
        let state = self.state.read();

        let mut scored: Vec<(f64, &ToolRecord)> = state
            .documents
            .iter()
            .filter(|d| d.record.server_id == server_id)
            .map(|d| {
                let name = d.record.tool_name.to_lowercase();
                let score = if name.contains(&wanted) || wanted.contains(&name) {
                    0.9f64.max(similarity(&wanted, &name))
                } else {
                    similarity(&wanted, &name)
                };
                (score, &d.record)
            })
            .filter(|(score, _)| *score > SUGGESTION_FLOOR)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, r)| r.clone()).collect()
    }
}
