use anyhow::{Context, Result};
use regex::Regex;

const UNIT_PATTERN: &str = concat!(
    r#"(?s)Sub_Query_\d+:\s*"<begin_of_query>\s*(.*?)\s*<end_of_query>"\s*"#,
    r#"Desc\d+:\s*"<begin_of_desc>\s*(.*?)\s*<end_of_desc>""#,
);

/// One retrieval intent carved out of a composite query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub sub_query: String,
    pub description: String,
}

impl Unit {
    /// Sub-query and description as one text, as scored by joint embedding and lexical backends.
    pub fn joint_text(&self) -> String {
        format!("{} {}", self.sub_query, self.description)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct UnitExtractor {
    pattern: Regex,
}

impl UnitExtractor {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(UNIT_PATTERN).context("failed to compile unit template regex")?;
        Ok(Self { pattern })
    }

    /// Units in the order they appear; the whole text becomes a single
    /// description-less unit when the template never matches.
    pub fn extract(&self, query_text: &str) -> Vec<Unit> {
        let units = self
            .pattern
            .captures_iter(query_text)
            .map(|captures| Unit {
                sub_query: captures
                    .get(1)
                    .map(|value| value.as_str().trim().to_string())
                    .unwrap_or_default(),
                description: captures
                    .get(2)
                    .map(|value| value.as_str().trim().to_string())
                    .unwrap_or_default(),
            })
            .collect::<Vec<Unit>>();

        if units.is_empty() {
            return vec![Unit {
                sub_query: query_text.to_string(),
                description: String::new(),
            }];
        }
        units
    }
}
