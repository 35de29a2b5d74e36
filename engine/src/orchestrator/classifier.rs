use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agents::HandlerKind;

const TRANSLATION_MARKERS: &[&str] = &[
    "translate",
    "translation",
    "in portuguese",
    "in english",
    "in spanish",
];

const KNOWLEDGE_MARKERS: &[&str] = &["what is", "define", "explain", "tell me about", "how does"];

/// Words that keep a knowledge-style question on the data path
const KNOWLEDGE_VETO: &[&str] = &["data", "orders", "customers", "products", "sales"];

const DATA_MARKERS: &[&str] = &[
    "orders",
    "customers",
    "products",
    "sales",
    "revenue",
    "category",
    "categories",
    "seller",
    "data",
];

/// Route chosen for a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    DataQuery,
    Translation,
    Knowledge,
    General,
}

impl Intent {
    /// Route implied by a router plan's primary handler
    pub fn from_handler(kind: HandlerKind) -> Option<Self> {
        match kind {
            HandlerKind::QueryGenerator | HandlerKind::ResultAnalyst => Some(Intent::DataQuery),
            HandlerKind::Translator => Some(Intent::Translation),
            HandlerKind::KnowledgeLookup => Some(Intent::Knowledge),
            HandlerKind::Router => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::DataQuery => "data_query",
            Intent::Translation => "translation",
            Intent::Knowledge => "knowledge",
            Intent::General => "general",
        };
        f.write_str(name)
    }
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}

/// Keyword classification; the first matching rule wins
pub fn classify(question: &str) -> Intent {
    let lower = question.to_lowercase();

    if contains_any(&lower, TRANSLATION_MARKERS) {
        return Intent::Translation;
    }
    if contains_any(&lower, KNOWLEDGE_MARKERS) && !contains_any(&lower, KNOWLEDGE_VETO) {
        return Intent::Knowledge;
    }
    if contains_any(&lower, DATA_MARKERS) {
        return Intent::DataQuery;
    }
    Intent::General
}

/// Translation target named in the question, English by default
pub fn target_language(question: &str) -> &'static str {
    let lower = question.to_lowercase();
    if lower.contains("portuguese") {
        "Portuguese"
    } else if lower.contains("spanish") {
        "Spanish"
    } else {
        "English"
    }
}
