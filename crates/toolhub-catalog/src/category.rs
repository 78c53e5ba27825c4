//! Coarse tool categories.
//!
//! A tool's category comes from the owning server's name when it matches a
//! known service, otherwise from keyword patterns over the tool name and
//! description.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Tool category for organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Source control, issues, CI
    Development,
    /// Chat and mail
    Communication,
    /// Documents, notes, calendars, tasks
    Productivity,
    /// Local files
    FileSystem,
    /// SQL and key-value stores
    Database,
    /// Web and knowledge search
    Search,
    /// Browser automation and page fetching
    Browser,
    /// Cloud infrastructure
    Cloud,
    /// Error tracking, logs, metrics
    Monitoring,
    /// Payments and commerce
    Finance,
    Other,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 11] = [
        Self::Development,
        Self::Communication,
        Self::Productivity,
        Self::FileSystem,
        Self::Database,
        Self::Search,
        Self::Browser,
        Self::Cloud,
        Self::Monitoring,
        Self::Finance,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Communication => "communication",
            Self::Productivity => "productivity",
            Self::FileSystem => "file_system",
            Self::Database => "database",
            Self::Search => "search",
            Self::Browser => "browser",
            Self::Cloud => "cloud",
            Self::Monitoring => "monitoring",
            Self::Finance => "finance",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .iter()
            .find(|c| c.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

/// Known services, checked in order against the lowercased server name.
const SERVICE_CATEGORIES: &[(&str, ToolCategory)] = &[
    ("github", ToolCategory::Development),
    ("gitlab", ToolCategory::Development),
    ("bitbucket", ToolCategory::Development),
    ("gitea", ToolCategory::Development),
    ("jira", ToolCategory::Development),
    ("linear", ToolCategory::Development),
    ("sentry", ToolCategory::Monitoring),
    ("datadog", ToolCategory::Monitoring),
    ("grafana", ToolCategory::Monitoring),
    ("slack", ToolCategory::Communication),
    ("discord", ToolCategory::Communication),
    ("gmail", ToolCategory::Communication),
    ("teams", ToolCategory::Communication),
    ("notion", ToolCategory::Productivity),
    ("gdrive", ToolCategory::Productivity),
    ("google-drive", ToolCategory::Productivity),
    ("calendar", ToolCategory::Productivity),
    ("todoist", ToolCategory::Productivity),
    ("obsidian", ToolCategory::Productivity),
    ("filesystem", ToolCategory::FileSystem),
    ("postgres", ToolCategory::Database),
    ("mysql", ToolCategory::Database),
    ("sqlite", ToolCategory::Database),
    ("mongo", ToolCategory::Database),
    ("redis", ToolCategory::Database),
    ("supabase", ToolCategory::Database),
    ("brave", ToolCategory::Search),
    ("tavily", ToolCategory::Search),
    ("perplexity", ToolCategory::Search),
    ("puppeteer", ToolCategory::Browser),
    ("playwright", ToolCategory::Browser),
    ("browser", ToolCategory::Browser),
    ("fetch", ToolCategory::Browser),
    ("aws", ToolCategory::Cloud),
    ("gcp", ToolCategory::Cloud),
    ("azure", ToolCategory::Cloud),
    ("cloudflare", ToolCategory::Cloud),
    ("kubernetes", ToolCategory::Cloud),
    ("docker", ToolCategory::Cloud),
    ("stripe", ToolCategory::Finance),
    ("shopify", ToolCategory::Finance),
];

/// Keyword patterns over tool name and description, checked in order.
static PATTERN_CATEGORIES: Lazy<Vec<(Regex, ToolCategory)>> = Lazy::new(|| {
    [
        (r"\b(files?|director(y|ies)|folders?|paths?)\b", ToolCategory::FileSystem),
        (r"\b(sql|quer(y|ies)|tables?|databases?|rows?)\b", ToolCategory::Database),
        (r"\b(repos?|repositor(y|ies)|commits?|branch(es)?|pull|issues?|merge)\b", ToolCategory::Development),
        (r"\b(messages?|channels?|chat|emails?|mail|dm)\b", ToolCategory::Communication),
        (r"\b(navigate|screenshot|click|browser|page|url|scrape)\b", ToolCategory::Browser),
        (r"\b(search|web|lookup)\b", ToolCategory::Search),
        (r"\b(docs?|documents?|notes?|pages?|calendar|events?|tasks?)\b", ToolCategory::Productivity),
        (r"\b(errors?|logs?|metrics?|alerts?|incidents?)\b", ToolCategory::Monitoring),
        (r"\b(buckets?|instances?|clusters?|deploy(ment)?s?|containers?)\b", ToolCategory::Cloud),
        (r"\b(payments?|invoices?|charges?|customers?|orders?)\b", ToolCategory::Finance),
    ]
    .into_iter()
    .filter_map(|(pattern, category)| Regex::new(&format!("(?i){}", pattern)).ok().map(|re| (re, category)))
    .collect()
});

/// Category for a server's tool.
pub fn categorize(server_name: &str, tool_name: &str, description: Option<&str>) -> ToolCategory {
    let server = server_name.to_lowercase();
    if let Some((_, category)) = SERVICE_CATEGORIES
        .iter()
        .find(|(service, _)| server.contains(service))
    {
        return *category;
    }

    // Tool names are usually snake_case; make word boundaries visible
    let text = format!(
        "{} {}",
        tool_name.replace(['_', '-', '.'], " "),
        description.unwrap_or_default()
    );
    PATTERN_CATEGORIES
        .iter()
        .find(|(re, _)| re.is_match(&text))
        .map(|(_, category)| *category)
        .unwrap_or(ToolCategory::Other)
}
