//! Recipient-gift association.
//!
//! A message contains mentions (`<@U123>` or `<@U123|name>`) and gift markers
//! (configured pictographs or textual aliases). Every marker is attributed to
//! the mention whose end offset is the greatest one still at or before the
//! marker's start offset. Markers without such a mention are dropped.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Recipient id → units, ordered by recipient id.
pub type GiftMap = BTreeMap<String, u32>;

const MENTION_PATTERN: &str = r"<@([A-Z0-9]+)(?:\|[^>]*)?>";

/// How a message expresses quantity. The two modes never combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantityMode {
    /// Every marker occurrence is one unit.
    #[default]
    Markers,
    /// A run of adjacent markers is one gift whose size is the integer written
    /// immediately before the run (`<@U1> 3 🍺`), defaulting to one.
    Numeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn overlaps(self, other: Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug)]
struct Mention<'a> {
    span: Span,
    user: &'a str,
}

#[derive(Debug, Clone)]
pub struct GiftAssociator {
    mention_re: Regex,
    marker_re: Regex,
    mode: QuantityMode,
    max_quantity: u32,
}

impl GiftAssociator {
    /// Build an associator for the given marker aliases.
    ///
    /// Longer aliases are tried first so `:beers:` wins over `:beer`. Purely
    /// alphanumeric aliases (`beer`) only match as whole words.
    pub fn new<S: AsRef<str>>(markers: &[S], mode: QuantityMode) -> Result<Self, regex::Error> {
        let mut aliases: Vec<&str> = markers
            .iter()
            .map(|m| m.as_ref().trim())
            .filter(|m| !m.is_empty())
            .collect();
        aliases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        aliases.dedup();

        let alternation = aliases
            .iter()
            .map(|alias| {
                let escaped = regex::escape(alias);
                if alias.chars().all(char::is_alphanumeric) {
                    format!(r"\b{escaped}\b")
                } else {
                    escaped
                }
            })
            .collect::<Vec<_>>()
            .join("|");

        // An empty alternation would match everywhere; `[^\s\S]` never matches.
        let marker_pattern = if alternation.is_empty() {
            r"[^\s\S]".to_string()
        } else {
            format!("(?:{alternation})")
        };

        Ok(Self {
            mention_re: Regex::new(MENTION_PATTERN)?,
            marker_re: Regex::new(&marker_pattern)?,
            mode,
            max_quantity: u32::MAX,
        })
    }

    /// Cap a single written quantity at `max` units. Larger numerals, including
    /// ones too long to parse, are read as `max`.
    pub fn with_max_quantity(mut self, max: u32) -> Self {
        self.max_quantity = max.max(1);
        self
    }

    /// True when the text contains at least one gift marker outside a mention.
    pub fn has_markers(&self, text: &str) -> bool {
        let mentions = self.mentions(text);
        !self.markers(text, &mentions).is_empty()
    }

    /// Map each recipient to the number of units attributed to them.
    pub fn associate(&self, text: &str) -> GiftMap {
        let mentions = self.mentions(text);
        let markers = self.markers(text, &mentions);
        let mut gifts = GiftMap::new();
        if mentions.is_empty() || markers.is_empty() {
            return gifts;
        }

        match self.mode {
            QuantityMode::Markers => {
                for marker in markers {
                    if let Some(mention) = nearest_preceding(&mentions, marker.start) {
                        add_units(&mut gifts, mention.user, 1);
                    }
                }
            }
            QuantityMode::Numeral => {
                for run in marker_runs(&markers) {
                    let Some(mention) = nearest_preceding(&mentions, run.start) else {
                        continue;
                    };
                    let Some(quantity) = numeral_before(text, mention.span.end, run.start) else {
                        continue;
                    };
                    add_units(&mut gifts, mention.user, quantity.min(self.max_quantity));
                }
            }
        }

        gifts
    }

    fn mentions<'a>(&self, text: &'a str) -> Vec<Mention<'a>> {
        self.mention_re
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let user = caps.get(1)?;
                Some(Mention {
                    span: Span {
                        start: whole.start(),
                        end: whole.end(),
                    },
                    user: user.as_str(),
                })
            })
            .collect()
    }

    fn markers(&self, text: &str, mentions: &[Mention<'_>]) -> Vec<Span> {
        self.marker_re
            .find_iter(text)
            .map(|m| Span {
                start: m.start(),
                end: m.end(),
            })
            .filter(|span| !mentions.iter().any(|mention| mention.span.overlaps(*span)))
            .collect()
    }
}

/// Sum of units over all recipients.
pub fn total_units(gifts: &GiftMap) -> u64 {
    gifts.values().map(|&n| u64::from(n)).sum()
}

fn add_units(gifts: &mut GiftMap, user: &str, units: u32) {
    let entry = gifts.entry(user.to_string()).or_default();
    *entry = entry.saturating_add(units);
}

fn nearest_preceding<'m, 'a>(mentions: &'m [Mention<'a>], offset: usize) -> Option<&'m Mention<'a>> {
    // Mentions are disjoint and ordered, so their end offsets ascend.
    let idx = mentions.partition_point(|m| m.span.end <= offset);
    idx.checked_sub(1).map(|i| &mentions[i])
}

fn marker_runs(markers: &[Span]) -> Vec<Span> {
    let mut runs: Vec<Span> = Vec::new();
    for marker in markers {
        match runs.last_mut() {
            Some(run) if run.end == marker.start => run.end = marker.end,
            _ => runs.push(*marker),
        }
    }
    runs
}

/// Quantity written between `floor` and `run_start`; one when no numeral is
/// present, `None` when the numeral is zero. Numerals beyond `u32` read as
/// `u32::MAX`.
fn numeral_before(text: &str, floor: usize, run_start: usize) -> Option<u32> {
    let between = &text[floor..run_start];
    let trimmed = between.trim_end();
    let digits_len = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits_len == 0 {
        return Some(1);
    }
    let digits_start = trimmed.len() - digits_len;
    if trimmed[..digits_start]
        .chars()
        .next_back()
        .is_some_and(char::is_alphanumeric)
    {
        // Part of a larger word such as `v2`; not a quantity.
        return Some(1);
    }
    let digits = trimmed[digits_start..].trim_start_matches('0');
    if digits.is_empty() {
        return None;
    }
    Some(digits.parse::<u32>().unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beer() -> GiftAssociator {
        GiftAssociator::new(&["🍺", ":beer:"], QuantityMode::Markers).unwrap()
    }

    fn map(pairs: &[(&str, u32)]) -> GiftMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn attributes_markers_to_nearest_preceding_mention() {
        let gifts = beer().associate("hey <@U1> 🍺🍺 <@U2> 🍺");
        assert_eq!(gifts, map(&[("U1", 2), ("U2", 1)]));
        assert_eq!(total_units(&gifts), 3);
    }

    #[test]
    fn markers_before_any_mention_are_dropped() {
        let gifts = beer().associate("🍺 <@U1>");
        assert!(gifts.is_empty());
        assert!(beer().has_markers("🍺 <@U1>"));
    }

    #[test]
    fn textual_alias_counts_like_pictograph() {
        let gifts = beer().associate("<@U1> :beer::beer: and 🍺");
        assert_eq!(gifts, map(&[("U1", 3)]));
    }

    #[test]
    fn repeated_mentions_accumulate() {
        let gifts = beer().associate("<@U1> 🍺 <@U2> 🍺 <@U1> 🍺");
        assert_eq!(gifts, map(&[("U1", 2), ("U2", 1)]));
    }

    #[test]
    fn labelled_mentions_are_recognised() {
        let gifts = beer().associate("<@U1|alice> 🍺");
        assert_eq!(gifts, map(&[("U1", 1)]));
    }

    #[test]
    fn numerals_are_ignored_in_marker_mode() {
        let gifts = beer().associate("<@U1> 5 🍺");
        assert_eq!(gifts, map(&[("U1", 1)]));
    }

    #[test]
    fn no_markers_yields_empty_map() {
        assert!(beer().associate("thanks <@U1>!").is_empty());
        assert!(!beer().has_markers("thanks <@U1>!"));
        assert!(beer().associate("").is_empty());
    }

    #[test]
    fn word_alias_requires_word_boundary() {
        let assoc = GiftAssociator::new(&["beer"], QuantityMode::Markers).unwrap();
        assert_eq!(assoc.associate("<@U1> beer"), map(&[("U1", 1)]));
        assert!(assoc.associate("<@U1> rootbeer").is_empty());
    }

    #[test]
    fn markers_inside_mention_labels_are_not_counted() {
        let assoc = GiftAssociator::new(&["beer"], QuantityMode::Markers).unwrap();
        assert!(assoc.associate("<@U1|beer>").is_empty());
    }

    #[test]
    fn empty_marker_list_never_matches() {
        let assoc = GiftAssociator::new::<&str>(&[], QuantityMode::Markers).unwrap();
        assert!(assoc.associate("<@U1> 🍺").is_empty());
    }

    #[test]
    fn numeral_mode_reads_quantity_before_run() {
        let assoc = GiftAssociator::new(&["🍺"], QuantityMode::Numeral).unwrap();
        assert_eq!(assoc.associate("<@U1> 3 🍺 <@U2> 🍺🍺"), map(&[("U1", 3), ("U2", 1)]));
    }

    #[test]
    fn numeral_mode_skips_zero_quantity() {
        let assoc = GiftAssociator::new(&["🍺"], QuantityMode::Numeral).unwrap();
        assert!(assoc.associate("<@U1> 0 🍺").is_empty());
    }

    #[test]
    fn numeral_mode_caps_each_quantity() {
        let assoc = GiftAssociator::new(&["🍺"], QuantityMode::Numeral)
            .unwrap()
            .with_max_quantity(10);
        assert_eq!(assoc.associate("<@U1> 25 🍺"), map(&[("U1", 10)]));
        assert_eq!(
            assoc.associate("<@U1> 99999999999999999999 🍺 <@U2> 3 🍺"),
            map(&[("U1", 10), ("U2", 3)])
        );
    }

    #[test]
    fn numeral_mode_saturates_instead_of_overflowing() {
        let assoc = GiftAssociator::new(&["🍺"], QuantityMode::Numeral).unwrap();
        let gifts = assoc.associate("<@U1> 4294967295 🍺 <@U1> 2 🍺");
        assert_eq!(gifts, map(&[("U1", u32::MAX)]));
        assert_eq!(total_units(&gifts), u64::from(u32::MAX));
    }

    #[test]
    fn numeral_mode_ignores_digits_glued_to_words() {
        let assoc = GiftAssociator::new(&["🍺"], QuantityMode::Numeral).unwrap();
        assert_eq!(assoc.associate("<@U1> v2 🍺"), map(&[("U1", 1)]));
    }
}
