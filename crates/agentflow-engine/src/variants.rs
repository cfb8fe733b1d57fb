// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Search variant generation for smart-retry escalation.
//!
//! From one `(title, location, skills)` triple the generator derives a
//! priority-ordered list of widened searches: first the exact ask,
//! then growing radii, then title synonyms, then skills used as
//! titles. The retry controller walks this list when earlier attempts
//! come back empty.

use agentflow_core::ExecutionContext;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Hard cap on generated variants.
pub const MAX_VARIANTS: usize = 15;

/// Radii (km) used for the radius-expansion tier.
const EXPANSION_RADII: [u32; 3] = [10, 20, 50];

/// One `(what, where, radius)` search tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchVariant {
    /// Strategy tag: `exact`, `radius_expansion`, `title_synonym` or
    /// `skill_fallback`.
    pub strategy: String,

    /// Lower priorities run earlier. Priority 0 is the user's exact ask.
    pub priority: i64,

    /// Search term.
    pub what: String,

    /// Search location.
    #[serde(rename = "where")]
    pub location: String,

    /// Search radius in km.
    pub radius: u32,

    /// Human-readable description shown in status messages.
    pub description: String,
}

/// Fixed role → alternative-titles mapping for the synonym tier.
fn title_synonyms(title: &str) -> &'static [&'static str] {
    match title.trim().to_lowercase().as_str() {
        "geschäftsführer" => &["Niederlassungsleiter", "Betriebsleiter"],
        "softwareentwickler" => &["Programmierer", "Software Engineer"],
        "vertriebsleiter" => &["Verkaufsleiter", "Sales Manager"],
        "projektleiter" => &["Projektmanager", "Project Manager"],
        "buchhalter" => &["Finanzbuchhalter", "Bilanzbuchhalter"],
        _ => &[],
    }
}

/// Deterministic variant generator.
pub struct VariantGenerator;

impl VariantGenerator {
    /// Generate the sorted variant list for a base triple.
    pub fn generate(base_title: &str, base_location: &str, skills: &[String]) -> Vec<SearchVariant> {
        let mut variants = Vec::new();

        variants.push(SearchVariant {
            strategy: "exact".to_string(),
            priority: 0,
            what: base_title.to_string(),
            location: base_location.to_string(),
            radius: 0,
            description: format!("Exakte Suche: {} in {}", base_title, base_location),
        });

        for (index, radius) in EXPANSION_RADII.iter().enumerate() {
            variants.push(SearchVariant {
                strategy: "radius_expansion".to_string(),
                priority: index as i64 + 1,
                what: base_title.to_string(),
                location: base_location.to_string(),
                radius: *radius,
                description: format!(
                    "Suche: {} in {} (Umkreis {} km)",
                    base_title, base_location, radius
                ),
            });
        }

        for (index, synonym) in title_synonyms(base_title).iter().enumerate() {
            variants.push(SearchVariant {
                strategy: "title_synonym".to_string(),
                priority: (index as i64 + 1) * 10,
                what: (*synonym).to_string(),
                location: base_location.to_string(),
                radius: 0,
                description: format!("Alternative Bezeichnung: {} in {}", synonym, base_location),
            });
        }

        let mut skill_priority = 100;
        for skill in skills {
            let skill = skill.trim();
            if skill.is_empty() || skill.eq_ignore_ascii_case(base_title) {
                continue;
            }
            variants.push(SearchVariant {
                strategy: "skill_fallback".to_string(),
                priority: skill_priority,
                what: skill.to_string(),
                location: base_location.to_string(),
                radius: 0,
                description: format!("Suche nach Kompetenz: {} in {}", skill, base_location),
            });
            skill_priority += 10;
        }

        variants.sort_by_key(|v| v.priority);
        variants.truncate(MAX_VARIANTS);
        variants
    }

    /// Generate and write `search_variants_list` and
    /// `search_variants_count` into the context in one go. Returns the
    /// variant count.
    pub fn apply(
        ctx: &ExecutionContext,
        base_title: &str,
        base_location: &str,
        skills: &[String],
    ) -> usize {
        let variants = Self::generate(base_title, base_location, skills);
        let count = variants.len();

        // Both keys land together so readers never observe one
        // without the other.
        ctx.set(
            "search_variants_list",
            serde_json::to_value(&variants).unwrap_or_else(|_| json!([])),
        );
        ctx.set("search_variants_count", json!(count));

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_default() -> Vec<SearchVariant> {
        VariantGenerator::generate("Geschäftsführer", "Sereetz", &["PHP".to_string()])
    }

    // Exact ask first, then radii, then synonyms, then skills.
    #[test]
    fn test_escalation_order() {
        let variants = generate_default();

        assert_eq!(variants[0].what, "Geschäftsführer");
        assert_eq!(variants[0].location, "Sereetz");
        assert_eq!(variants[0].radius, 0);
        assert_eq!(variants[0].priority, 0);

        assert_eq!(variants[1].radius, 10);
        assert_eq!(variants[2].radius, 20);

        let synonym = variants.iter().find(|v| v.priority == 10).unwrap();
        assert_eq!(synonym.what, "Niederlassungsleiter");
        assert_eq!(synonym.location, "Sereetz");
        assert_eq!(synonym.radius, 0);

        let skill = variants
            .iter()
            .find(|v| v.strategy == "skill_fallback")
            .unwrap();
        assert_eq!(skill.what, "PHP");
        assert!(skill.priority >= 100);
    }

    #[test]
    fn test_strictly_sorted_by_priority() {
        let variants = generate_default();
        for pair in variants.windows(2) {
            assert!(pair[0].priority < pair[1].priority);
        }
    }

    #[test]
    fn test_cap_is_enforced() {
        let skills: Vec<String> = (0..30).map(|i| format!("Skill{}", i)).collect();
        let variants = VariantGenerator::generate("Geschäftsführer", "Sereetz", &skills);
        assert_eq!(variants.len(), MAX_VARIANTS);
    }

    #[test]
    fn test_unknown_title_has_no_synonym_tier() {
        let variants = VariantGenerator::generate("Astronaut", "Berlin", &[]);
        assert!(variants.iter().all(|v| v.strategy != "title_synonym"));
        assert_eq!(variants.len(), 4);
    }

    #[test]
    fn test_skill_equal_to_title_is_dropped() {
        let variants =
            VariantGenerator::generate("PHP", "Berlin", &["php".to_string(), "SQL".to_string()]);
        let skills: Vec<&str> = variants
            .iter()
            .filter(|v| v.strategy == "skill_fallback")
            .map(|v| v.what.as_str())
            .collect();
        assert_eq!(skills, vec!["SQL"]);
    }

    #[test]
    fn test_apply_writes_both_context_keys() {
        let ctx = ExecutionContext::new();
        let count =
            VariantGenerator::apply(&ctx, "Geschäftsführer", "Sereetz", &["PHP".to_string()]);

        let list = ctx.get("search_variants_list").unwrap();
        assert_eq!(list.as_array().unwrap().len(), count);
        assert_eq!(ctx.get("search_variants_count").unwrap(), serde_json::json!(count));
    }

    #[test]
    fn test_wire_format_uses_where() {
        let variants = generate_default();
        let value = serde_json::to_value(&variants[0]).unwrap();
        assert_eq!(value["where"], serde_json::json!("Sereetz"));
        assert!(value.get("location").is_none());
    }
}
