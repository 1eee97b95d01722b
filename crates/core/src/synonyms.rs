//! Synonym-group expansion for colloquial, euphemism-heavy input.
//!
//! A query term that belongs to a group pulls in *every* other member of
//! that group. The same table annotates content before it is embedded, so a
//! note about "testicles" also sits near "nuts" in vector space.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A named set of interchangeable terms. Membership is symmetric.
#[derive(Debug, Clone, Copy)]
pub struct SynonymGroup {
    pub name: &'static str,
    pub terms: &'static [&'static str],
}

/// Built-in table. No term appears in more than one group.
pub static SYNONYM_GROUPS: &[SynonymGroup] = &[
    SynonymGroup {
        name: "testicles",
        terms: &["testicles", "testes", "balls", "nuts", "family jewels", "gonads", "cojones", "bollocks"],
    },
    SynonymGroup {
        name: "breasts",
        terms: &["breasts", "boobs", "tits", "bust", "knockers", "jugs"],
    },
    SynonymGroup {
        name: "toilet",
        terms: &[
            "toilet", "bathroom", "restroom", "loo", "lavatory", "washroom", "john", "potty", "wc",
            "powder room", "latrine", "throne",
        ],
    },
    SynonymGroup {
        name: "urinate",
        terms: &["pee", "urinate", "wee", "piss", "tinkle", "take a leak", "pee-pee"],
    },
    SynonymGroup {
        name: "defecate",
        terms: &["poop", "poo", "crap", "dump", "number two", "bowel movement", "stool", "feces"],
    },
    SynonymGroup {
        name: "flatulence",
        terms: &["fart", "flatulence", "toot", "pass gas", "break wind", "trump"],
    },
    SynonymGroup {
        name: "vomit",
        terms: &["vomit", "throw up", "puke", "barf", "hurl", "upchuck", "spew", "ralph"],
    },
    SynonymGroup {
        name: "intoxicated",
        terms: &[
            "drunk", "wasted", "hammered", "tipsy", "smashed", "plastered", "intoxicated", "sloshed",
            "tanked", "buzzed", "inebriated",
        ],
    },
    SynonymGroup {
        name: "sex",
        terms: &["sex", "intercourse", "hooking up", "making love", "shag", "bonk", "intimacy"],
    },
    SynonymGroup {
        name: "money",
        terms: &["money", "cash", "dough", "bucks", "moolah", "funds", "dosh", "quid", "loot", "greenbacks"],
    },
    SynonymGroup {
        name: "death",
        terms: &[
            "died", "passed away", "deceased", "kicked the bucket", "departed", "perished",
            "no longer with us", "dead",
        ],
    },
    SynonymGroup {
        name: "illness",
        terms: &["sick", "ill", "unwell", "under the weather", "poorly", "ailing", "off colour"],
    },
    SynonymGroup {
        name: "doctor",
        terms: &["doctor", "physician", "gp", "doc", "medic", "md", "clinician"],
    },
    SynonymGroup {
        name: "children",
        terms: &["kids", "kid", "children", "child", "kiddos", "little ones", "youngsters", "offspring"],
    },
    SynonymGroup {
        name: "spouse",
        terms: &["wife", "husband", "spouse", "partner", "hubby", "missus", "better half", "other half"],
    },
    SynonymGroup {
        name: "birthday",
        terms: &["birthday", "bday", "b-day", "birth day", "birthdate", "day of birth"],
    },
    SynonymGroup {
        name: "groceries",
        terms: &["groceries", "grocery", "shopping", "supplies", "provisions", "food shop"],
    },
    SynonymGroup {
        name: "car",
        terms: &["car", "vehicle", "auto", "automobile", "motor", "wheels"],
    },
    SynonymGroup {
        name: "sleep",
        terms: &["sleep", "nap", "snooze", "doze", "shut-eye", "kip", "forty winks"],
    },
    SynonymGroup {
        name: "home",
        terms: &["home", "house", "residence", "pad", "dwelling", "place"],
    },
];

/// A query together with its synonym expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedQuery {
    /// Original query text.
    pub original: String,
    /// Text to embed: the original followed by the added terms.
    pub expanded: String,
    /// Lowercased tokens of the original query.
    pub terms: Vec<String>,
    /// Terms contributed by synonym groups (not present in the original).
    pub expansion_terms: Vec<String>,
    pub was_expanded: bool,
}

/// Table-driven many-to-many synonym expansion.
#[derive(Debug, Clone)]
pub struct SynonymExpander {
    groups: &'static [SynonymGroup],
    /// term -> index of the first group containing it.
    lookup: HashMap<String, usize>,
}

impl Default for SynonymExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl SynonymExpander {
    /// Expander over the built-in [`SYNONYM_GROUPS`].
    pub fn new() -> Self {
        Self::with_groups(SYNONYM_GROUPS)
    }

    pub fn with_groups(groups: &'static [SynonymGroup]) -> Self {
        let mut lookup = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            for term in group.terms {
                lookup.entry(term.to_lowercase()).or_insert(i);
            }
        }
        Self { groups, lookup }
    }

    /// The group `term` belongs to, if any. Case-insensitive.
    pub fn group_of(&self, term: &str) -> Option<&SynonymGroup> {
        self.lookup
            .get(&term.trim().to_lowercase())
            .map(|&i| &self.groups[i])
    }

    /// Expand terms with every other member of their group.
    ///
    /// Output has set semantics (lowercased, no duplicates) and keeps the
    /// input terms first, in order.
    pub fn expand<S: AsRef<str>>(&self, terms: &[S]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for term in terms {
            let t = term.as_ref().trim().to_lowercase();
            if !t.is_empty() && seen.insert(t.clone()) {
                out.push(t);
            }
        }
        for term in terms {
            if let Some(group) = self.group_of(term.as_ref()) {
                for member in group.terms {
                    let m = member.to_lowercase();
                    if seen.insert(m.clone()) {
                        out.push(m);
                    }
                }
            }
        }
        out
    }

    /// Tokenize and expand a free-text query.
    pub fn expand_query(&self, query: &str) -> ExpandedQuery {
        let terms = tokenize(query);
        // Multi-word group members ("under the weather") are matched as phrases.
        let mut lookups = terms.clone();
        lookups.extend(self.phrases_in(query));
        let expanded_terms = self.expand(&lookups);
        let present: HashSet<&str> = lookups.iter().map(String::as_str).collect();
        let expansion_terms: Vec<String> = expanded_terms
            .iter()
            .filter(|t| !present.contains(t.as_str()))
            .cloned()
            .collect();
        let expanded = if expansion_terms.is_empty() {
            query.to_string()
        } else {
            format!("{} {}", query, expansion_terms.join(" "))
        };
        ExpandedQuery {
            original: query.to_string(),
            expanded,
            was_expanded: !expansion_terms.is_empty(),
            terms,
            expansion_terms,
        }
    }

    /// Other members of every group mentioned in `content`, excluding the
    /// ones already present.
    pub fn related_terms(&self, content: &str) -> Vec<String> {
        let present = self.phrases_in(content);
        if present.is_empty() {
            return Vec::new();
        }
        let present_set: HashSet<&str> = present.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for term in &present {
            let Some(group) = self.group_of(term) else {
                continue;
            };
            for member in group.terms {
                if !present_set.contains(member) && seen.insert(*member) {
                    out.push(member.to_string());
                }
            }
        }
        out
    }

    /// Append a `[related terms: ...]` annotation when `content` mentions any
    /// group member. Content without matches is returned unchanged.
    pub fn annotate(&self, content: &str) -> String {
        let related = self.related_terms(content);
        if related.is_empty() {
            content.to_string()
        } else {
            format!("{content} [related terms: {}]", related.join(", "))
        }
    }

    /// Every table term (single word or phrase) appearing in `text`, in
    /// table order.
    fn phrases_in(&self, text: &str) -> Vec<String> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let token_set: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        let padded = format!(" {} ", tokens.join(" "));
        let mut out = Vec::new();
        for group in self.groups {
            for term in group.terms {
                let hit = if term.contains(' ') {
                    padded.contains(&format!(" {term} "))
                } else {
                    token_set.contains(term)
                };
                if hit {
                    out.push(term.to_string());
                }
            }
        }
        out
    }
}

/// Lowercased word tokens. Hyphens and apostrophes inside a word are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
        .map(|t| t.trim_matches(|c| c == '-' || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_to_whole_group() {
        let ex = SynonymExpander::new();
        let out = ex.expand(&["nuts"]);
        assert_eq!(out[0], "nuts");
        for member in ["testicles", "balls", "family jewels", "gonads"] {
            assert!(out.contains(&member.to_string()), "missing {member}");
        }
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn expansion_is_case_insensitive_and_deduplicated() {
        let ex = SynonymExpander::new();
        let out = ex.expand(&["Loo", "TOILET", "keys"]);
        assert_eq!(&out[..3], &["loo", "toilet", "keys"]);
        let unique: HashSet<&String> = out.iter().collect();
        assert_eq!(unique.len(), out.len());
        assert!(out.contains(&"restroom".to_string()));
    }

    #[test]
    fn unknown_terms_pass_through() {
        let ex = SynonymExpander::new();
        assert_eq!(ex.expand(&["spanner"]), vec!["spanner".to_string()]);
    }

    #[test]
    fn membership_is_symmetric() {
        let ex = SynonymExpander::new();
        for group in SYNONYM_GROUPS {
            for x in group.terms {
                let expanded_x = ex.expand(&[*x]);
                for y in &expanded_x {
                    let expanded_y = ex.expand(&[y.as_str()]);
                    assert!(
                        expanded_y.contains(&x.to_string()),
                        "{x} -> {y} but not {y} -> {x}"
                    );
                }
            }
        }
    }

    #[test]
    fn groups_are_mutually_exclusive_and_sized() {
        let mut seen = HashMap::new();
        for group in SYNONYM_GROUPS {
            assert!(
                (5..=20).contains(&group.terms.len()),
                "group {} has {} terms",
                group.name,
                group.terms.len()
            );
            for term in group.terms {
                if let Some(prev) = seen.insert(*term, group.name) {
                    panic!("{term} in both {prev} and {}", group.name);
                }
            }
        }
    }

    #[test]
    fn query_expansion_appends_new_terms_only() {
        let ex = SynonymExpander::new();
        let q = ex.expand_query("bday tomorrow");
        assert!(q.was_expanded);
        assert_eq!(q.terms, vec!["bday", "tomorrow"]);
        assert!(q.expanded.starts_with("bday tomorrow "));
        assert!(q.expansion_terms.contains(&"birthday".to_string()));
        assert!(!q.expansion_terms.contains(&"bday".to_string()));

        let plain = ex.expand_query("spare keys");
        assert!(!plain.was_expanded);
        assert_eq!(plain.expanded, "spare keys");
    }

    #[test]
    fn phrase_members_expand_from_queries() {
        let ex = SynonymExpander::new();
        let q = ex.expand_query("felt under the weather");
        assert!(q.expansion_terms.contains(&"sick".to_string()));
    }

    #[test]
    fn content_annotation_lists_related_terms() {
        let ex = SynonymExpander::new();
        let text = ex.annotate("Got hit in the testicles at football");
        assert!(text.starts_with("Got hit in the testicles at football [related terms: "));
        assert!(text.contains("nuts"));
        assert!(!text.contains("terms: testicles"));

        assert_eq!(ex.annotate("Water the plants"), "Water the plants");
    }

    #[test]
    fn tokenize_keeps_inner_hyphens() {
        assert_eq!(
            tokenize("Mom's b-day -- shut-eye!"),
            vec!["mom's", "b-day", "shut-eye"]
        );
    }
}
