//! Filename-based routing of reports to destination topics.
//!
//! Matching is a case-insensitive substring test against an ordered list of keywords;
//! the first matching route wins. A filename containing several keywords (for example
//! `user_server_warn.pdf`) therefore goes to whichever route is listed first.

use serde::{Deserialize, Serialize};

use crate::config::RouteConfig;
use crate::contract::Destination;

/// Processing priority. Only used to order the batch produced by a directory scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Default priority for a keyword when the route does not set one.
    pub fn for_keyword(keyword: &str) -> Self {
        let keyword = keyword.to_lowercase();
        if keyword.contains("server") {
            Priority::High
        } else if keyword.contains("warn") {
            Priority::Low
        } else {
            Priority::Normal
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    keyword: String,
    destination: Destination,
    priority: Priority,
}

impl Route {
    pub fn new(keyword: &str, destination: Destination, priority: Priority) -> Self {
        Self {
            keyword: keyword.trim().to_lowercase(),
            destination,
            priority,
        }
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }
}

impl From<&RouteConfig> for Route {
    fn from(cfg: &RouteConfig) -> Self {
        let priority = cfg
            .priority
            .unwrap_or_else(|| Priority::for_keyword(&cfg.keyword));
        Route::new(
            &cfg.keyword,
            Destination::new(cfg.label.clone(), cfg.topic_id),
            priority,
        )
    }
}

/// Result of a successful classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub destination: Destination,
    pub priority: Priority,
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    routes: Vec<Route>,
}

impl Classifier {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn from_config(routes: &[RouteConfig]) -> Self {
        Self::new(routes.iter().map(Route::from).collect())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Returns the destination for `file_name`, or `None` when no keyword matches.
    pub fn classify(&self, file_name: &str) -> Option<Classification> {
        let name = file_name.to_lowercase();
        self.routes
            .iter()
            .filter(|route| !route.keyword.is_empty())
            .find(|route| name.contains(&route.keyword))
            .map(|route| Classification {
                destination: route.destination.clone(),
                priority: route.priority,
            })
    }
}

/// Caption shown under the uploaded document.
pub fn caption_for(destination: &Destination, file_name: &str, size_bytes: u64) -> String {
    format!(
        "{}\n{} ({})",
        destination.label,
        file_name,
        human_size(size_bytes)
    )
}

fn human_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
