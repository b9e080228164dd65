use tracing::{debug, warn};

use crate::model::{BaselinePattern, InstalledItem, MatchResult, MatchType};
use crate::pattern::WildcardPattern;

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matches: Vec<MatchResult>,
    pub warnings: Vec<String>,
}

struct CompiledPattern<'a> {
    baseline: &'a BaselinePattern,
    exact: String,
    contains: WildcardPattern,
    dotted: Option<DottedPattern>,
}

/// `Publisher.NamePart`, split at the first dot.
struct DottedPattern {
    publisher: WildcardPattern,
    name_part: WildcardPattern,
}

impl<'a> CompiledPattern<'a> {
    fn compile(baseline: &'a BaselinePattern) -> Result<Self, String> {
        let contains = WildcardPattern::contains(&baseline.pattern).map_err(|err| err.to_string())?;
        let dotted = baseline
            .pattern
            .trim()
            .split_once('.')
            .and_then(|(publisher, name_part)| {
                Some(DottedPattern {
                    publisher: WildcardPattern::contains(publisher).ok()?,
                    name_part: WildcardPattern::contains(name_part).ok()?,
                })
            });
        Ok(Self {
            baseline,
            exact: baseline.pattern.trim().to_lowercase(),
            contains,
            dotted,
        })
    }

    fn matches(&self, tier: MatchType, item: &InstalledItem) -> bool {
        match tier {
            MatchType::Exact => item.names().any(|name| name.trim().to_lowercase() == self.exact),
            MatchType::PublisherName => match (&self.dotted, item.publisher.as_deref()) {
                (Some(dotted), Some(publisher)) => {
                    dotted.publisher.is_match(publisher)
                        && item.names().any(|name| dotted.name_part.is_match(name))
                }
                _ => false,
            },
            MatchType::Wildcard => item.names().any(|name| self.contains.is_match(name)),
            MatchType::Publisher => item
                .publisher
                .as_deref()
                .is_some_and(|publisher| self.contains.is_match(publisher)),
        }
    }
}

/// Classifies each item by at most one pattern.
///
/// Tiers are evaluated in [`MatchType::PRIORITY`] order across all patterns,
/// so an item always gets its highest-confidence classification; within a
/// tier the first pattern in baseline order wins.
pub fn match_items(items: &[InstalledItem], patterns: &[BaselinePattern]) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    if patterns.is_empty() {
        warn!("baseline contains no patterns; nothing will be matched");
        outcome
            .warnings
            .push("baseline contains no patterns; nothing was matched".to_string());
        return outcome;
    }

    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        match CompiledPattern::compile(pattern) {
            Ok(value) => compiled.push(value),
            Err(reason) => {
                warn!(pattern = %pattern.pattern, %reason, "skipping malformed pattern");
                outcome.warnings.push(reason);
            }
        }
    }

    for item in items.iter().filter(|item| !item.is_blank()) {
        if let Some((tier, pattern)) = classify(item, &compiled) {
            debug!(item = %item.name, pattern = %pattern.baseline.pattern, ?tier, "item matched");
            outcome.matches.push(MatchResult {
                item: item.clone(),
                matched_pattern: pattern.baseline.pattern.clone(),
                category: pattern.baseline.category.clone(),
                match_type: tier,
                confidence: tier.confidence(),
                source: item.source,
            });
        }
    }
    outcome
}

fn classify<'p, 'a>(
    item: &InstalledItem,
    compiled: &'p [CompiledPattern<'a>],
) -> Option<(MatchType, &'p CompiledPattern<'a>)> {
    MatchType::PRIORITY.iter().find_map(|tier| {
        compiled
            .iter()
            .find(|pattern| pattern.matches(*tier, item))
            .map(|pattern| (*tier, pattern))
    })
}

#[cfg(test)]
mod tests {
    use super::match_items;
    use crate::model::{BaselinePattern, InstalledItem, MatchType, Source};

    fn item(name: &str, publisher: Option<&str>, source: Source) -> InstalledItem {
        InstalledItem {
            publisher: publisher.map(str::to_string),
            ..InstalledItem::new(name, source)
        }
    }

    fn patterns(raw: &[&str]) -> Vec<BaselinePattern> {
        raw.iter()
            .map(|pattern| BaselinePattern::new(*pattern, "common"))
            .collect()
    }

    #[test]
    fn dotted_pattern_inside_name_is_a_wildcard_match() {
        let items = vec![item("Candy.CrushSaga", Some("King"), Source::Appx)];
        let outcome = match_items(&items, &patterns(&["Candy.Crush"]));
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].match_type, MatchType::Wildcard);
        assert_eq!(outcome.matches[0].confidence, 80);
    }

    #[test]
    fn publisher_and_name_segments_score_95() {
        let items = vec![item(
            "CandyCrushSaga",
            Some("King Digital Entertainment"),
            Source::Registry,
        )];
        let outcome = match_items(&items, &patterns(&["king.candycrush"]));
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].match_type, MatchType::PublisherName);
        assert_eq!(outcome.matches[0].confidence, 95);
    }

    #[test]
    fn exact_name_wins_over_earlier_weaker_pattern() {
        let items = vec![item("Microsoft.BingNews", Some("CN=Microsoft Corporation"), Source::Appx)];
        let outcome = match_items(&items, &patterns(&["Bing", "Microsoft.BingNews"]));
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].match_type, MatchType::Exact);
        assert_eq!(outcome.matches[0].matched_pattern, "Microsoft.BingNews");
    }

    #[test]
    fn display_name_participates_in_matching() {
        let mut registry = item("{0A1B}", Some("Dell Inc."), Source::Registry);
        registry.display_name = Some("Dell SupportAssist".to_string());
        let outcome = match_items(&[registry], &patterns(&["supportassist"]));
        assert_eq!(outcome.matches[0].match_type, MatchType::Wildcard);
    }

    #[test]
    fn publisher_only_match_scores_70() {
        let items = vec![item("Some Toolbar", Some("Ask Partner Network"), Source::Registry)];
        let outcome = match_items(&items, &patterns(&["Ask Partner"]));
        assert_eq!(outcome.matches[0].match_type, MatchType::Publisher);
        assert_eq!(outcome.matches[0].confidence, 70);
    }

    #[test]
    fn at_most_one_result_per_item() {
        let items = vec![
            item("Microsoft.XboxApp", Some("Microsoft"), Source::Appx),
            item("Notepad++", Some("Notepad++ Team"), Source::Registry),
        ];
        let outcome = match_items(
            &items,
            &patterns(&["Xbox", "Microsoft.Xbox*", "Microsoft", "Microsoft.XboxApp"]),
        );
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].item.name, "Microsoft.XboxApp");
        assert_eq!(outcome.matches[0].match_type, MatchType::Exact);
    }

    #[test]
    fn blank_items_are_ignored() {
        let items = vec![item("   ", None, Source::Registry)];
        let outcome = match_items(&items, &patterns(&["a"]));
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn empty_pattern_list_warns_without_matching() {
        let items = vec![item("Candy.CrushSaga", None, Source::Appx)];
        let outcome = match_items(&items, &[]);
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn malformed_patterns_are_skipped_not_fatal() {
        let items = vec![item("Candy.CrushSaga", None, Source::Appx)];
        let outcome = match_items(&items, &patterns(&["", "*", "candy"]));
        assert_eq!(outcome.warnings.len(), 2);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].matched_pattern, "candy");
    }
}
