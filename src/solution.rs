//! Solution Resolver: turns a validated error code into the tiered answer.
//!
//! The mini companion entry, when it has content, is the primary
//! user-facing answer; the full entry rides along behind
//! `has_full_available` so the caller can offer a "show full" affordance.
//! A resolved code with no content anywhere still comes back carrying the
//! code — the caller needs it for diagnostics even with nothing to show.

use tracing::debug;

use crate::kb::KnowledgeBase;
use crate::models::Solution;

/// Cut a raw panic string at the first occurrence of the literal token
/// `slide` — everything after it is disassembly noise, not signature.
pub fn truncate_at_slide(text: &str) -> &str {
    text.split_once("slide")
        .map(|(before, _)| before)
        .unwrap_or(text)
        .trim()
}

/// Build the tiered [`Solution`] for a validated code. `product` may be
/// absent or unknown to the Knowledge Base; the code survives regardless.
pub fn resolve_solution(kb: &KnowledgeBase, code: &str, product: Option<&str>) -> Solution {
    let full = product.and_then(|p| kb.lookup_code(p, code));
    let mini = product.and_then(|p| kb.mini_entry(p, code));

    let mut solution = Solution {
        error_code: Some(code.to_string()),
        ..Default::default()
    };

    match (mini, full) {
        (Some(mini), full) if mini.has_content() => {
            debug!(code, "showing mini tier");
            solution.descriptions = mini.solutions;
            solution.links = mini.links;
            solution.is_mini_shown = true;
            solution.image = mini.image;
            if let Some(full) = full {
                if full.has_content() {
                    solution.has_full_available = true;
                    solution.full_descriptions = Some(full.solutions);
                    solution.full_links = Some(full.links);
                    if solution.image.is_none() {
                        solution.image = full.image;
                    }
                }
            }
        }
        (_, Some(full)) if full.has_content() => {
            debug!(code, "showing full tier");
            solution.descriptions = full.solutions;
            solution.links = full.links;
            solution.image = full.image;
        }
        _ => {
            debug!(code, "code resolved but no solution content");
        }
    }

    solution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::Sheet;

    fn kb() -> KnowledgeBase {
        let mut sheet = Sheet::default();
        sheet.name = "en".to_string();
        sheet.rows = vec![
            vec!["".into(), "iPhone X".into()],
            vec!["Code".into(), "iPhone10,1".into()],
            vec![
                "\"wdog\"".into(),
                "Full fix step;http://kb.example/full".into(),
            ],
            vec!["\"wdog\" mini".into(), "Quick fix".into()],
            vec!["\"SoC\"".into(), "Only full content".into()],
            vec!["\"bare\"".into(), "".into()],
        ];
        KnowledgeBase::from_sheet(Some(sheet))
    }

    #[test]
    fn mini_primary_with_full_behind_flag() {
        let s = resolve_solution(&kb(), "\"wdog\"", Some("iPhone10,1"));
        assert!(s.is_mini_shown);
        assert!(s.has_full_available);
        assert_eq!(s.descriptions, vec!["Quick fix".to_string()]);
        assert_eq!(
            s.full_descriptions,
            Some(vec!["Full fix step".to_string()])
        );
        assert_eq!(
            s.full_links,
            Some(vec!["http://kb.example/full".to_string()])
        );
        assert!(s.has_content());
    }

    #[test]
    fn full_shown_when_no_mini() {
        let s = resolve_solution(&kb(), "\"SoC\"", Some("iPhone10,1"));
        assert!(!s.is_mini_shown);
        assert!(!s.has_full_available);
        assert_eq!(s.descriptions, vec!["Only full content".to_string()]);
        assert!(s.full_descriptions.is_none());
    }

    #[test]
    fn code_survives_with_no_content() {
        let s = resolve_solution(&kb(), "\"bare\"", Some("iPhone10,1"));
        assert_eq!(s.error_code.as_deref(), Some("\"bare\""));
        assert!(!s.has_content());
        assert!(!s.is_mini_shown);
    }

    #[test]
    fn unknown_product_keeps_the_code() {
        let s = resolve_solution(&kb(), "\"wdog\"", Some("iPad1,1"));
        assert_eq!(s.error_code.as_deref(), Some("\"wdog\""));
        assert!(!s.has_content());

        let s = resolve_solution(&kb(), "\"wdog\"", None);
        assert_eq!(s.error_code.as_deref(), Some("\"wdog\""));
        assert!(!s.has_content());
    }

    #[test]
    fn slide_truncation() {
        assert_eq!(truncate_at_slide("foo bar slide 0x1234"), "foo bar");
        assert_eq!(truncate_at_slide("no marker here"), "no marker here");
        assert_eq!(truncate_at_slide("slide right away"), "");
        assert_eq!(
            truncate_at_slide("wdog timeout  slide: 0x1 slide: 0x2"),
            "wdog timeout"
        );
    }
}
