//! Node and relationship pattern DSL
//!
//! Patterns declare how record fields map onto graph entities. A node
//! pattern names labels, the properties forming the merge key (prefixed
//! with `!`), and a property selection:
//!
//! ```text
//! (:User{!id,name,email})          include name and email
//! (:User{!id,*})                   include everything else
//! (:User{!id,-internal})           include everything except internal
//! User{!id}                        simple form, parentheses optional
//! ```
//!
//! A relationship pattern connects two node patterns:
//!
//! ```text
//! (:User{!id})-[:BOUGHT{price}]->(:Product{!sku})
//! (:Product{!sku})<-[:BOUGHT]-(:User{!id})        reversed arrow
//! User{!id} BOUGHT Product{!sku}                  simple form
//! ```
//!
//! Parsed configurations are immutable and shared read-only across all
//! consumer tasks.

use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors raised while parsing a pattern string
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern does not match the grammar
    #[error("invalid pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },

    /// Included and excluded properties are mixed in one selection
    #[error("property selection in '{0}' is not homogeneous")]
    NotHomogeneous(String),

    /// No `!`-prefixed key token present
    #[error("pattern '{0}' must contain at least one key")]
    MissingKey(String),
}

impl PatternError {
    fn invalid(pattern: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

/// How the property selection of a pattern is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PatternType {
    /// Project every non-key field
    All,
    /// Project only the listed fields
    Include,
    /// Project every non-key field except the listed ones
    Exclude,
}

/// Parsed node pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePattern {
    /// Property names forming the merge key, always non-empty
    pub keys: BTreeSet<String>,
    /// Property selection mode
    pub pattern_type: PatternType,
    /// Labels in source order, always non-empty
    pub labels: Vec<String>,
    /// Selected property names (empty for [`PatternType::All`])
    pub properties: Vec<String>,
    /// Merge projected properties into existing ones instead of replacing
    pub merge_properties: bool,
}

impl NodePattern {
    /// Parse a node pattern in rich (`(:Label{..})`) or simple
    /// (`Label{..}`) form.
    ///
    /// The rich form requires the leading `:` before the first label; the
    /// simple form accepts a bare label.
    pub fn parse(pattern: &str, merge_properties: bool) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        let (body, rich) = match trimmed.strip_prefix('(') {
            Some(rest) => {
                let inner = rest
                    .strip_suffix(')')
                    .ok_or_else(|| PatternError::invalid(pattern, "unbalanced parentheses"))?;
                (inner.trim(), true)
            }
            None => (trimmed, false),
        };

        if rich && !body.starts_with(':') {
            return Err(PatternError::invalid(
                pattern,
                "labels must start with ':' inside parentheses",
            ));
        }

        let (label_part, tokens) = split_properties(pattern, body)?;
        let labels = parse_labels(pattern, label_part)?;
        let (keys, rest) = split_keys(pattern, &tokens)?;
        if keys.is_empty() {
            return Err(PatternError::MissingKey(pattern.to_string()));
        }
        let (pattern_type, properties) = determine_type(pattern, rest)?;

        Ok(Self {
            keys,
            pattern_type,
            labels,
            properties,
            merge_properties,
        })
    }
}

/// Parsed relationship pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipPattern {
    /// Pattern of the relationship's start node
    pub start: NodePattern,
    /// Pattern of the relationship's end node
    pub end: NodePattern,
    /// Relationship type
    pub rel_type: String,
    /// Selected relationship property names
    pub properties: Vec<String>,
    /// Property selection mode for the relationship
    pub pattern_type: PatternType,
    /// Merge projected properties into existing ones instead of replacing
    pub merge_properties: bool,
}

impl RelationshipPattern {
    /// Parse a relationship pattern in rich or simple form.
    ///
    /// A reversed arrow (`<-[..]-`) swaps start and end in the result.
    pub fn parse(pattern: &str, merge_properties: bool) -> Result<Self, PatternError> {
        let normalized = strip_arrow_whitespace(pattern.trim());
        let trimmed = normalized.as_str();

        if let Some((left, rest)) = trimmed.split_once("<-[") {
            let (middle, right) = rest
                .split_once("]-")
                .ok_or_else(|| PatternError::invalid(pattern, "unterminated relationship"))?;
            if right.starts_with('>') {
                return Err(PatternError::invalid(pattern, "conflicting arrow direction"));
            }
            // Reversed arrow: the right-hand node is the start.
            Self::from_parts(pattern, right, middle, left, merge_properties)
        } else if let Some((left, rest)) = trimmed.split_once("-[") {
            let (middle, right) = rest
                .split_once("]->")
                .ok_or_else(|| PatternError::invalid(pattern, "unterminated relationship"))?;
            Self::from_parts(pattern, left, middle, right, merge_properties)
        } else {
            Self::parse_simple(pattern, trimmed, merge_properties)
        }
    }

    fn from_parts(
        pattern: &str,
        start: &str,
        middle: &str,
        end: &str,
        merge_properties: bool,
    ) -> Result<Self, PatternError> {
        let middle = middle.trim();
        let middle = middle
            .strip_prefix(':')
            .ok_or_else(|| PatternError::invalid(pattern, "relationship type must start with ':'"))?;
        let (rel_type, tokens) = split_rel_type(pattern, middle)?;

        let start = parse_endpoint(pattern, start, merge_properties)?;
        let end = parse_endpoint(pattern, end, merge_properties)?;
        let (pattern_type, properties) = parse_rel_selection(pattern, &tokens)?;

        Ok(Self {
            start,
            end,
            rel_type,
            properties,
            pattern_type,
            merge_properties,
        })
    }

    fn parse_simple(
        pattern: &str,
        body: &str,
        merge_properties: bool,
    ) -> Result<Self, PatternError> {
        let segments = split_top_level(body);
        if segments.len() != 3 {
            return Err(PatternError::invalid(
                pattern,
                "expected '<start> <REL_TYPE> <end>'",
            ));
        }

        let start = NodePattern::parse(segments[0], merge_properties)?;
        let end = NodePattern::parse(segments[2], merge_properties)?;

        let middle = segments[1].strip_prefix(':').unwrap_or(segments[1]);
        let (rel_type, tokens) = split_rel_type(pattern, middle)?;
        let (pattern_type, properties) = parse_rel_selection(pattern, &tokens)?;

        Ok(Self {
            start,
            end,
            rel_type,
            properties,
            pattern_type,
            merge_properties,
        })
    }
}

/// Separate `!`-prefixed key tokens from the remaining property tokens
fn split_keys(
    pattern: &str,
    tokens: &[String],
) -> Result<(BTreeSet<String>, Vec<String>), PatternError> {
    let mut keys = BTreeSet::new();
    let mut rest: Vec<String> = Vec::new();

    for token in tokens {
        if let Some(key) = token.strip_prefix('!') {
            let key = key.trim();
            if key.is_empty() {
                return Err(PatternError::invalid(pattern, "empty key token"));
            }
            keys.insert(key.to_string());
        } else {
            rest.push(token.clone());
        }
    }
    Ok((keys, rest))
}

/// Classify the non-key tokens of a selection
///
/// The selection must be homogeneous: either all bare names, all
/// `-`-prefixed, or a lone `*`.
fn determine_type(
    pattern: &str,
    rest: Vec<String>,
) -> Result<(PatternType, Vec<String>), PatternError> {
    if rest.is_empty() || rest == ["*"] {
        return Ok((PatternType::All, Vec::new()));
    }
    if rest.iter().any(|t| t == "*") {
        // '*' combined with an explicit selection contradicts itself.
        return Err(PatternError::NotHomogeneous(pattern.to_string()));
    }
    let excluded = rest.iter().filter(|t| t.starts_with('-')).count();
    if excluded == 0 {
        Ok((PatternType::Include, rest))
    } else if excluded == rest.len() {
        let stripped = rest
            .iter()
            .map(|t| t.trim_start_matches('-').trim().to_string())
            .collect();
        Ok((PatternType::Exclude, stripped))
    } else {
        Err(PatternError::NotHomogeneous(pattern.to_string()))
    }
}

/// Parse the property selection of a relationship body, which admits no keys
fn parse_rel_selection(
    pattern: &str,
    tokens: &[String],
) -> Result<(PatternType, Vec<String>), PatternError> {
    let (keys, rest) = split_keys(pattern, tokens)?;
    if !keys.is_empty() {
        return Err(PatternError::invalid(
            pattern,
            "relationship properties cannot contain keys",
        ));
    }
    determine_type(pattern, rest)
}

/// Split a node body into its label part and property tokens
fn split_properties<'a>(
    pattern: &str,
    body: &'a str,
) -> Result<(&'a str, Vec<String>), PatternError> {
    match body.split_once('{') {
        Some((labels, rest)) => {
            let props = rest
                .strip_suffix('}')
                .ok_or_else(|| PatternError::invalid(pattern, "unbalanced braces"))?;
            let tokens = props
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            Ok((labels.trim(), tokens))
        }
        None => Ok((body.trim(), Vec::new())),
    }
}

fn parse_labels(pattern: &str, label_part: &str) -> Result<Vec<String>, PatternError> {
    let labels: Vec<String> = label_part
        .trim_start_matches(':')
        .split(':')
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if labels.is_empty() {
        return Err(PatternError::invalid(pattern, "at least one label required"));
    }
    if labels.iter().any(|l| l.chars().any(char::is_whitespace)) {
        return Err(PatternError::invalid(pattern, "labels cannot contain whitespace"));
    }
    Ok(labels)
}

/// Split a relationship type segment into the type name and property tokens
fn split_rel_type(pattern: &str, segment: &str) -> Result<(String, Vec<String>), PatternError> {
    let (rel_type, tokens) = split_properties(pattern, segment.trim())?;
    let rel_type = rel_type.trim();
    if rel_type.is_empty() || rel_type.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err(PatternError::invalid(pattern, "invalid relationship type"));
    }
    Ok((rel_type.to_string(), tokens))
}

/// Parse a rich-form relationship endpoint
///
/// Endpoints may list non-key properties, but wildcard and exclusion tokens
/// make no sense on a merge target and are rejected.
fn parse_endpoint(
    pattern: &str,
    segment: &str,
    merge_properties: bool,
) -> Result<NodePattern, PatternError> {
    let node = NodePattern::parse(segment, merge_properties)?;
    if node.pattern_type == PatternType::Exclude {
        return Err(PatternError::invalid(
            pattern,
            "endpoint patterns cannot exclude properties",
        ));
    }
    Ok(node)
}

/// Drop top-level whitespace adjacent to arrow punctuation so spaced-out
/// rich forms like `(:A{!a}) <-[:R]- (:B{!b})` parse like compact ones
fn strip_arrow_whitespace(input: &str) -> String {
    const ARROW: [char; 6] = ['-', '<', '>', '[', ']', ')'];
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;

    for (i, &c) in chars.iter().enumerate() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth == 0 && c.is_whitespace() {
            let prev = out.chars().next_back();
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            let prev_arrow = prev.map(|p| ARROW.contains(&p)).unwrap_or(false);
            let next_arrow = next
                .map(|n| ARROW.contains(n) || *n == '(')
                .unwrap_or(false);
            if prev_arrow && next_arrow {
                continue;
            }
            if prev == Some(']') || prev == Some('>') || matches!(next, Some('[') | Some('<')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Split on whitespace, ignoring whitespace nested inside braces
fn split_top_level(input: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in input.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() && depth == 0 => {
                if let Some(s) = start.take() {
                    segments.push(&input[s..i]);
                }
                continue;
            }
            _ => {}
        }
        if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        segments.push(&input[s..]);
    }
    segments
}
