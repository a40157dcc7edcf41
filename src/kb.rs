//! Knowledge Base: language-partitioned repair guidance keyed by
//! (error code × product column).
//!
//! Structural contract of the workbook: row 1 holds display names, row 2
//! holds product-identifier headers, rows ≥ 3 hold `(error code, solution
//! text per product column)`. Codes in column A are quoted and carry
//! escaped forward slashes (`\/`); comparison happens on a normalized form.
//! A `"<code> mini"` row is an independent condensed companion of `code`.
//!
//! Lookups are read-only and in-memory. The known-code list is an
//! atomically swapped snapshot: readers clone an `Arc`, the reload
//! operation replaces the whole set in one store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::models::{DeviceModel, KnowledgeEntry, SolutionTier};
use crate::workbook::{Sheet, Workbook};

/// Index of the display-name header row.
const DISPLAY_ROW: usize = 0;
/// Index of the product-identifier header row.
const PRODUCT_ROW: usize = 1;
/// First data row (error codes live in column A from here on).
const FIRST_DATA_ROW: usize = 2;

/// Canonical form used for all code comparisons: quotes dropped, `\/`
/// unescaped, trimmed, lowercased. Idempotent.
pub fn normalize_code(raw: &str) -> String {
    raw.replace('"', "").replace("\\/", "/").trim().to_lowercase()
}

/// Product identifiers are compared lowercased with spaces stripped.
pub fn normalize_product(raw: &str) -> String {
    raw.to_lowercase().replace(' ', "")
}

/// Split a cell's free text on `;`: tokens starting with `http` are links,
/// the rest are solution descriptions. Empty tokens are dropped.
pub fn filter_cell(text: &str) -> (Vec<String>, Vec<String>) {
    let mut solutions = Vec::new();
    let mut links = Vec::new();
    for token in text.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.starts_with("http") {
            links.push(token.to_string());
        } else {
            solutions.push(token.to_string());
        }
    }
    (solutions, links)
}

struct CodeRow {
    norm: String,
    row_index: usize,
}

/// One language sheet, indexed at load time: product header → column,
/// normalized code → row. Missing workbook or sheet degrades to an empty
/// table (lookups miss, nothing crashes).
pub struct KnowledgeBase {
    sheet: Option<Sheet>,
    products: HashMap<String, usize>,
    rows: Vec<CodeRow>,
}

impl KnowledgeBase {
    pub fn load(workbook: &Path, language: &str) -> Self {
        let sheet = match Workbook::open(workbook) {
            Ok(wb) => match wb.sheet(language) {
                Some(sheet) => Some(sheet.clone()),
                None => {
                    warn!(
                        language,
                        workbook = %workbook.display(),
                        "language sheet not found in workbook"
                    );
                    None
                }
            },
            Err(e) => {
                warn!(workbook = %workbook.display(), error = %e, "failed to open workbook");
                None
            }
        };
        Self::from_sheet(sheet)
    }

    pub fn from_sheet(sheet: Option<Sheet>) -> Self {
        let mut products = HashMap::new();
        let mut rows = Vec::new();

        if let Some(sheet) = &sheet {
            if let Some(header) = sheet.rows.get(PRODUCT_ROW) {
                for (col, value) in header.iter().enumerate() {
                    // Column A belongs to codes, not products.
                    if col == 0 || value.trim().is_empty() {
                        continue;
                    }
                    products.entry(normalize_product(value)).or_insert(col);
                }
            }
            for row_index in FIRST_DATA_ROW..sheet.rows.len() {
                let code = sheet.cell(row_index, 0);
                if code.trim().is_empty() {
                    continue;
                }
                rows.push(CodeRow {
                    norm: normalize_code(code),
                    row_index,
                });
            }
        }

        Self {
            sheet,
            products,
            rows,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.sheet.is_some()
    }

    /// Column index for a product identifier, per the row-2 header map.
    pub fn product_column(&self, product: &str) -> Option<usize> {
        self.products.get(&normalize_product(product)).copied()
    }

    fn find_row(&self, norm: &str) -> Option<usize> {
        self.rows
            .iter()
            .find(|r| r.norm == *norm)
            .map(|r| r.row_index)
    }

    /// Look up the full-tier entry for `(product, code)`.
    ///
    /// Returns `None` when the code has no row or the product has no
    /// column — an entry is only ever built from two concrete indices.
    /// When the matched row's cell for this product is empty, every other
    /// product column in the row is scanned and the first non-empty cell
    /// supplies the content (cross-model fallback), together with the
    /// image anchored at that exact cell.
    pub fn lookup_code(&self, product: &str, code: &str) -> Option<KnowledgeEntry> {
        let sheet = self.sheet.as_ref()?;
        let col = self.product_column(product)?;
        let row = self.find_row(&normalize_code(code))?;

        let own_cell = sheet.cell(row, col);
        if !own_cell.trim().is_empty() {
            let (solutions, links) = filter_cell(own_cell);
            return Some(KnowledgeEntry {
                error_code: code.to_string(),
                solutions,
                links,
                image: sheet.image_at(row, col).map(|b| b.to_vec()),
                tier: SolutionTier::Full,
            });
        }

        for fallback_col in 1..sheet.width() {
            if fallback_col == col {
                continue;
            }
            let cell = sheet.cell(row, fallback_col);
            if cell.trim().is_empty() {
                continue;
            }
            let (solutions, links) = filter_cell(cell);
            if solutions.is_empty() && links.is_empty() {
                continue;
            }
            debug!(code, fallback_col, "solution found via cross-model fallback column");
            return Some(KnowledgeEntry {
                error_code: code.to_string(),
                solutions,
                links,
                image: sheet.image_at(row, fallback_col).map(|b| b.to_vec()),
                tier: SolutionTier::Full,
            });
        }

        // The code row exists but no column has content for it.
        Some(KnowledgeEntry {
            error_code: code.to_string(),
            solutions: Vec::new(),
            links: Vec::new(),
            image: None,
            tier: SolutionTier::Full,
        })
    }

    /// Look up the `"<code> mini"` companion row. No fallback scan: the
    /// condensed tier is only shown when curated for this exact product.
    pub fn mini_entry(&self, product: &str, code: &str) -> Option<KnowledgeEntry> {
        let sheet = self.sheet.as_ref()?;
        let col = self.product_column(product)?;
        let norm = normalize_code(&format!("{} mini", code));
        let row = self.find_row(&norm)?;

        let cell = sheet.cell(row, col);
        if cell.trim().is_empty() {
            return None;
        }
        let (solutions, links) = filter_cell(cell);
        Some(KnowledgeEntry {
            error_code: code.to_string(),
            solutions,
            links,
            image: sheet.image_at(row, col).map(|b| b.to_vec()),
            tier: SolutionTier::Mini,
        })
    }

    /// Resolve a product identifier to its display identity using the two
    /// header rows. Misses echo the identifier rather than failing.
    pub fn device_model(
        &self,
        product: Option<&str>,
        os_version: Option<&str>,
        crash_key: Option<&str>,
    ) -> DeviceModel {
        let crash_reporter_key = crash_key.map(|k| k.to_lowercase());
        let Some(product) = product else {
            return DeviceModel {
                model: None,
                version: None,
                os_version: os_version.map(str::to_string),
                crash_reporter_key,
            };
        };

        let display = self
            .sheet
            .as_ref()
            .and_then(|sheet| {
                self.product_column(product).map(|col| {
                    let name = sheet.cell(DISPLAY_ROW, col);
                    if name.trim().is_empty() {
                        product.to_string()
                    } else {
                        name.to_string()
                    }
                })
            })
            .unwrap_or_else(|| product.to_string());

        DeviceModel {
            model: Some(display),
            version: Some(product.to_string()),
            os_version: os_version.map(str::to_string),
            crash_reporter_key,
        }
    }

    /// All raw codes in column A, in row order, plus the unescaped variant
    /// of any code containing `\/` — both spellings must be matchable.
    pub fn collect_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        let Some(sheet) = self.sheet.as_ref() else {
            return codes;
        };
        for row in &self.rows {
            let raw = sheet.cell(row.row_index, 0).trim().to_string();
            if raw.is_empty() {
                continue;
            }
            if !codes.contains(&raw) {
                codes.push(raw.clone());
            }
            if raw.contains("\\/") {
                let unescaped = raw.replace("\\/", "/");
                if !codes.contains(&unescaped) {
                    codes.push(unescaped);
                }
            }
        }
        codes
    }
}

/// Atomically swappable snapshot of the known-code list.
pub struct KnownCodes {
    inner: RwLock<Arc<Vec<String>>>,
}

impl KnownCodes {
    pub fn load(workbook: &Path, language: &str) -> Self {
        let codes = KnowledgeBase::load(workbook, language).collect_codes();
        debug!(count = codes.len(), "known-code list loaded");
        Self {
            inner: RwLock::new(Arc::new(codes)),
        }
    }

    pub fn from_codes(codes: Vec<String>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(codes)),
        }
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.inner.read().expect("known-code lock poisoned").clone()
    }

    /// Re-read the workbook and swap the whole list in one store. Returns
    /// the new code count.
    pub fn reload(&self, workbook: &Path, language: &str) -> usize {
        let codes = KnowledgeBase::load(workbook, language).collect_codes();
        let count = codes.len();
        *self.inner.write().expect("known-code lock poisoned") = Arc::new(codes);
        count
    }

    /// Codes offered to the suggestion stage: `" mini"` companions are
    /// internal rows, never suggestion candidates.
    pub fn suggestion_codes(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|c| !c.to_lowercase().contains(" mini"))
            .cloned()
            .collect()
    }

    /// Match a candidate against the list: exact first, then
    /// case-insensitive. Returns the canonical list entry.
    pub fn canonical_match(&self, candidate: &str) -> Option<String> {
        let snapshot = self.snapshot();
        if let Some(found) = snapshot.iter().find(|c| c.as_str() == candidate) {
            return Some(found.clone());
        }
        let lower = candidate.to_lowercase();
        snapshot
            .iter()
            .find(|c| c.to_lowercase() == lower)
            .cloned()
    }

    /// Direct-match short circuit: when the signature text itself contains
    /// exactly one known code (after normalization), inference is skipped.
    /// Nested matches collapse to the longest; distinct simultaneous
    /// matches are ambiguous and yield `None`.
    pub fn find_in_text(&self, text: &str) -> Option<String> {
        let haystack = normalize_code(text);
        if haystack.is_empty() {
            return None;
        }
        let snapshot = self.snapshot();
        let mut matches: Vec<(&String, String)> = snapshot
            .iter()
            .filter(|c| !c.to_lowercase().contains(" mini"))
            .map(|c| (c, normalize_code(c)))
            .filter(|(_, norm)| norm.len() >= 3 && haystack.contains(norm.as_str()))
            .collect();

        // Drop matches subsumed by a longer one ("wdog" inside "wdog timeout").
        let norms: Vec<String> = matches.iter().map(|(_, n)| n.clone()).collect();
        matches.retain(|(_, norm)| {
            !norms
                .iter()
                .any(|other| other.len() > norm.len() && other.contains(norm.as_str()))
        });

        // Two different codes both normalizing to the same form are one match.
        matches.dedup_by(|a, b| a.1 == b.1);

        match matches.as_slice() {
            [(code, _)] => Some((*code).clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_sheet() -> Sheet {
        let mut sheet = Sheet::default();
        sheet.name = "en".to_string();
        sheet.rows = vec![
            // row 1: display names
            vec![
                "".into(),
                "iPhone X".into(),
                "iPhone 8".into(),
                "iPhone 13 mini".into(),
            ],
            // row 2: product identifiers
            vec![
                "Code".into(),
                "iPhone10,1".into(),
                "iPhone 10,4".into(),
                "iPhone14,4".into(),
            ],
            // data rows
            vec![
                "\"wdog\"".into(),
                "Check PMIC;http://kb.example/wdog".into(),
                "".into(),
                "".into(),
            ],
            vec!["\"wdog\" mini".into(), "Short: reflow PMIC".into()],
            vec![
                "\"SoC\\/panic\"".into(),
                "".into(),
                "Inspect SoC rail".into(),
            ],
            vec!["\"thermalmonitord\"".into(), "".into(), "".into(), "".into()],
        ];
        sheet
    }

    fn kb() -> KnowledgeBase {
        KnowledgeBase::from_sheet(Some(fixture_sheet()))
    }

    #[test]
    fn normalize_is_idempotent_and_unescapes() {
        let once = normalize_code("\"A\\/B\"");
        assert_eq!(once, "a/b");
        assert_eq!(normalize_code(&once), once);
        assert_eq!(normalize_code("A\\/B"), normalize_code("A/B"));
    }

    #[test]
    fn product_header_is_normalized() {
        let kb = kb();
        assert_eq!(kb.product_column("iPhone10,1"), Some(1));
        // Header "iPhone 10,4" carries a stray space; both spellings match.
        assert_eq!(kb.product_column("iphone10,4"), Some(2));
        assert_eq!(kb.product_column("iPhone 10,4"), Some(2));
        assert_eq!(kb.product_column("iPad1,1"), None);
    }

    #[test]
    fn lookup_is_deterministic() {
        let kb = kb();
        let a = kb.lookup_code("iPhone10,1", "wdog").unwrap();
        let b = kb.lookup_code("iPhone10,1", "wdog").unwrap();
        assert_eq!(a.solutions, b.solutions);
        assert_eq!(a.links, b.links);
        assert_eq!(a.solutions, vec!["Check PMIC".to_string()]);
        assert_eq!(a.links, vec!["http://kb.example/wdog".to_string()]);
    }

    #[test]
    fn lookup_falls_back_to_other_columns() {
        let kb = kb();
        // iPhone10,1's own cell is empty for SoC/panic; iPhone 10,4 has content.
        let entry = kb.lookup_code("iPhone10,1", "SoC/panic").unwrap();
        assert_eq!(entry.solutions, vec!["Inspect SoC rail".to_string()]);
    }

    #[test]
    fn lookup_escaped_and_unescaped_spellings() {
        let kb = kb();
        assert!(kb.lookup_code("iPhone10,4", "SoC\\/panic").is_some());
        assert!(kb.lookup_code("iPhone10,4", "soc/panic").is_some());
    }

    #[test]
    fn matched_row_with_no_content_still_returns_entry() {
        let kb = kb();
        let entry = kb.lookup_code("iPhone10,1", "thermalmonitord").unwrap();
        assert!(!entry.has_content());
    }

    #[test]
    fn unknown_code_or_product_is_a_miss() {
        let kb = kb();
        assert!(kb.lookup_code("iPhone10,1", "nonexistent").is_none());
        assert!(kb.lookup_code("iPad1,1", "wdog").is_none());
    }

    #[test]
    fn mini_companion_found_by_suffix() {
        let kb = kb();
        let mini = kb.mini_entry("iPhone10,1", "wdog").unwrap();
        assert_eq!(mini.tier, SolutionTier::Mini);
        assert_eq!(mini.solutions, vec!["Short: reflow PMIC".to_string()]);
        // No mini row for the SoC code.
        assert!(kb.mini_entry("iPhone10,1", "SoC/panic").is_none());
    }

    #[test]
    fn device_model_resolves_display_name() {
        let kb = kb();
        let m = kb.device_model(Some("iPhone10,1"), Some("16.1"), Some("ABCDEF"));
        assert_eq!(m.model.as_deref(), Some("iPhone X"));
        assert_eq!(m.version.as_deref(), Some("iPhone10,1"));
        assert_eq!(m.crash_reporter_key.as_deref(), Some("abcdef"));

        let unknown = kb.device_model(Some("iPad1,1"), None, None);
        assert_eq!(unknown.model.as_deref(), Some("iPad1,1"));
    }

    #[test]
    fn missing_sheet_degrades_to_empty() {
        let kb = KnowledgeBase::from_sheet(None);
        assert!(!kb.is_loaded());
        assert!(kb.lookup_code("iPhone10,1", "wdog").is_none());
        assert!(kb.collect_codes().is_empty());
        let m = kb.device_model(Some("iPhone10,1"), None, None);
        assert_eq!(m.model.as_deref(), Some("iPhone10,1"));
    }

    #[test]
    fn collect_codes_adds_unescaped_variant() {
        let codes = kb().collect_codes();
        assert!(codes.contains(&"\"SoC\\/panic\"".to_string()));
        assert!(codes.contains(&"\"SoC/panic\"".to_string()));
        assert!(codes.contains(&"\"wdog\" mini".to_string()));
    }

    #[test]
    fn known_codes_snapshot_swaps_atomically() {
        let known = KnownCodes::from_codes(vec!["\"wdog\"".into()]);
        let before = known.snapshot();
        // A reload against a missing workbook swaps in the (empty) new set.
        let count = known.reload(Path::new("/nonexistent/panic_codes.xlsx"), "en");
        assert_eq!(count, 0);
        assert!(known.snapshot().is_empty());
        // The old snapshot held by a reader is untouched.
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn canonical_match_is_case_insensitive_only_as_fallback() {
        let known = KnownCodes::from_codes(vec!["\"WDOG\"".into(), "\"wdog\"".into()]);
        assert_eq!(known.canonical_match("\"wdog\""), Some("\"wdog\"".into()));
        assert_eq!(known.canonical_match("\"WdOg\""), Some("\"WDOG\"".into()));
        assert_eq!(known.canonical_match("\"other\""), None);
    }

    #[test]
    fn suggestion_codes_exclude_minis() {
        let known = KnownCodes::from_codes(vec!["\"wdog\"".into(), "\"wdog\" mini".into()]);
        assert_eq!(known.suggestion_codes(), vec!["\"wdog\"".to_string()]);
    }

    #[test]
    fn find_in_text_requires_a_single_match() {
        let known = KnownCodes::from_codes(vec![
            "\"wdog\"".into(),
            "\"wdog timeout\"".into(),
            "\"SoC\\/panic\"".into(),
        ]);
        // Nested: the longer code wins.
        assert_eq!(
            known.find_in_text("panic: wdog timeout on core 1"),
            Some("\"wdog timeout\"".into())
        );
        // Exactly one plain match.
        assert_eq!(
            known.find_in_text("userspace wdog triggered"),
            Some("\"wdog\"".into())
        );
        // Two distinct codes present: ambiguous.
        assert_eq!(known.find_in_text("wdog then soc/panic"), None);
        assert_eq!(known.find_in_text("nothing here"), None);
    }
}
