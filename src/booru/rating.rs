//! Content rating limits and the search restriction they produce.
//!
//! Each axis is totally ordered: permitting a level permits every level below
//! it, so the restriction for an axis is "exclude every tag strictly above the
//! permitted level".

use thiserror::Error;

/// r34 tags in ascending order of strictness
const R34_TAGS: [&str; 3] = ["suggestive", "questionable", "explicit"];
/// Dark tags in ascending order of strictness
const DARK_TAGS: [&str; 2] = ["semi-grimdark", "grimdark"];
const GROTESQUE_TAG: &str = "grotesque";
const SAFE_TAG: &str = "safe";

/// A rating level outside of the allowed range
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RatingError {
    /// r34 level must be 0..=3
    #[error("r34 level must be between 0 and 3, got {0}")]
    R34OutOfRange(u8),
    /// Dark level must be 0..=2
    #[error("dark level must be between 0 and 2, got {0}")]
    DarkOutOfRange(u8),
}

/// Permitted sexual content
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum R34Level {
    /// Safe only
    #[default]
    Safe,
    /// Up to suggestive
    Suggestive,
    /// Up to questionable
    Questionable,
    /// Everything, explicit included
    Explicit,
}

impl R34Level {
    const fn allowed_tags(self) -> usize {
        match self {
            Self::Safe => 0,
            Self::Suggestive => 1,
            Self::Questionable => 2,
            Self::Explicit => 3,
        }
    }
}

impl TryFrom<u8> for R34Level {
    type Error = RatingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Safe),
            1 => Ok(Self::Suggestive),
            2 => Ok(Self::Questionable),
            3 => Ok(Self::Explicit),
            other => Err(RatingError::R34OutOfRange(other)),
        }
    }
}

/// Permitted dark content
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DarkLevel {
    /// No dark content
    #[default]
    None,
    /// Up to semi-grimdark
    SemiGrimdark,
    /// Grimdark included
    Grimdark,
}

impl DarkLevel {
    const fn allowed_tags(self) -> usize {
        match self {
            Self::None => 0,
            Self::SemiGrimdark => 1,
            Self::Grimdark => 2,
        }
    }
}

impl TryFrom<u8> for DarkLevel {
    type Error = RatingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::SemiGrimdark),
            2 => Ok(Self::Grimdark),
            other => Err(RatingError::DarkOutOfRange(other)),
        }
    }
}

/// Rating limits of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RatingLimits {
    /// Highest permitted r34 rating
    pub r34: R34Level,
    /// Highest permitted dark rating
    pub dark: DarkLevel,
    /// Whether grotesque images are permitted
    pub grotesque: bool,
}

impl RatingLimits {
    /// Whether every axis sits at its most restrictive value
    #[must_use]
    pub fn is_strictest(&self) -> bool {
        self.r34 == R34Level::Safe && self.dark == DarkLevel::None && !self.grotesque
    }

    /// Clamp every axis to at most `max`.
    #[must_use]
    pub fn clamp_to(self, max: Self) -> Self {
        Self {
            r34: self.r34.min(max.r34),
            dark: self.dark.min(max.dark),
            grotesque: self.grotesque && max.grotesque,
        }
    }
}

/// Restriction terms for `limits`, quality floor first.
///
/// The strictest limits collapse into the single `safe` term instead of a
/// list of exclusions.
#[must_use]
pub fn rating_terms(limits: &RatingLimits, min_score: i64) -> Vec<String> {
    let mut terms = vec![format!("score.gte:{min_score}")];

    if limits.is_strictest() {
        terms.push(SAFE_TAG.to_string());
        return terms;
    }

    // Most explicit first, down to the first permitted tag.
    let excluded_r34 = R34_TAGS[limits.r34.allowed_tags()..].iter().rev();
    let excluded_dark = DARK_TAGS[limits.dark.allowed_tags()..].iter().rev();
    terms.extend(
        excluded_r34
            .chain(excluded_dark)
            .map(|tag| format!("-{tag}")),
    );
    if !limits.grotesque {
        terms.push(format!("-{GROTESQUE_TAG}"));
    }
    terms
}

/// A search query that could escape the group it is wrapped in
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueryError {
    /// A `)` without a matching `(`, or a `(` never closed
    #[error("unbalanced parentheses in search query")]
    UnbalancedParentheses,
    /// A `"` never closed
    #[error("unterminated quote in search query")]
    UnterminatedQuote,
    /// A trailing `\` would escape the closing parenthesis
    #[error("search query ends with an escape character")]
    TrailingEscape,
}

/// Check that `raw` stays inside a `( ... )` group.
///
/// Backslash escapes the next character; parentheses inside double quotes
/// are literal.
///
/// # Errors
///
/// Returns the first grouping problem found.
pub fn check_grouping(raw: &str) -> Result<(), QueryError> {
    let mut depth = 0usize;
    let mut quoted = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_none() {
                    return Err(QueryError::TrailingEscape);
                }
            }
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth = depth
                    .checked_sub(1)
                    .ok_or(QueryError::UnbalancedParentheses)?;
            }
            _ => {}
        }
    }

    if quoted {
        Err(QueryError::UnterminatedQuote)
    } else if depth != 0 {
        Err(QueryError::UnbalancedParentheses)
    } else {
        Ok(())
    }
}

/// Full search expression: the raw query grouped, ANDed with the restriction.
///
/// # Errors
///
/// Returns a `QueryError` if `raw` could break out of its group and
/// bypass the restriction.
pub fn build_search_query(
    raw: &str,
    limits: &RatingLimits,
    min_score: i64,
) -> Result<String, QueryError> {
    let raw = raw.trim();
    check_grouping(raw)?;
    let mut parts = vec![format!("({raw})")];
    parts.extend(rating_terms(limits, min_score));
    Ok(parts.join(","))
}
