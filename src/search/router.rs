//! Strategy selection
//!
//! First match wins:
//! 1. whole query is an error code -> exact
//! 2. `category:` prefix or a category option -> category
//! 3. `tag:` prefix or tag options -> tag
//! 4. complex (more than 3 tokens, or operator characters) -> hybrid
//! 5. short tokens or wildcards -> fuzzy
//! 6. otherwise -> fts

use std::sync::LazyLock;

use regex::Regex;

use super::Strategy;
use crate::query::{Query, QueryOperator, SearchOptions};

/// Error-code shapes, matched against the whole normalized query
static ERROR_CODE_PATTERNS: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    [
        // letter + 3-4 digits + optional letter: e1234, b37a
        Regex::new(r"^[a-z]\d{3,4}[a-z]?$").expect("valid regex"),
        // system completion codes: s806, s322a
        Regex::new(r"^s\d{3}[a-z]?$").expect("valid regex"),
        // abend codes in hex: s0c7, s0c4, u4038
        Regex::new(r"^[su][0-9a-f]{3,4}$").expect("valid regex"),
        // IBM message ids: ief212i, iec141i, dfh1234
        Regex::new(r"^[a-z]{3,4}\d{3,4}[a-z]?$").expect("valid regex"),
    ]
});

/// True when the whole query is a single error code
pub fn is_error_code(normalized: &str) -> bool {
    ERROR_CODE_PATTERNS.iter().any(|re| re.is_match(normalized))
}

/// Pick the strategy for a query. Deterministic, no I/O.
pub fn select(query: &Query, options: &SearchOptions) -> Strategy {
    if is_error_code(&query.normalized) {
        return Strategy::Exact;
    }
    if matches!(query.operator, Some(QueryOperator::Category(_))) || options.category.is_some() {
        return Strategy::Category;
    }
    if matches!(query.operator, Some(QueryOperator::Tag(_))) || !options.tags.is_empty() {
        return Strategy::Tag;
    }
    if query.is_complex() {
        Strategy::Hybrid
    } else if query.has_fuzzy_terms() {
        Strategy::Fuzzy
    } else {
        Strategy::Fts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    fn route(q: &str) -> Strategy {
        select(&Query::parse(q), &SearchOptions::default())
    }

    #[test]
    fn test_error_codes_route_exact() {
        for code in ["S0C7", "s0c4", "S806", "S322A", "U4038", "E1234", "IEF212I", "dfh1234"] {
            assert_eq!(route(code), Strategy::Exact, "{code}");
        }
    }

    #[test]
    fn test_error_code_must_be_whole_query() {
        assert_ne!(route("S0C7 abend"), Strategy::Exact);
        assert_ne!(route("abend"), Strategy::Exact);
    }

    #[test]
    fn test_category_prefix_and_option() {
        assert_eq!(route("category:JCL"), Strategy::Category);
        let opts = SearchOptions::default().with_category("JCL");
        assert_eq!(select(&Query::parse("dataset"), &opts), Strategy::Category);
    }

    #[test]
    fn test_category_beats_tag() {
        let opts = SearchOptions::default().with_category("JCL").with_tags(["vsam"]);
        assert_eq!(select(&Query::parse("tag:abend"), &opts), Strategy::Category);
    }

    #[test]
    fn test_error_code_beats_filters() {
        let opts = SearchOptions::default().with_category("COBOL");
        assert_eq!(select(&Query::parse("S0C7"), &opts), Strategy::Exact);
    }

    #[test]
    fn test_tag_prefix_and_option() {
        assert_eq!(route("tag:vsam"), Strategy::Tag);
        let opts = SearchOptions::default().with_tags(["vsam"]);
        assert_eq!(select(&Query::parse("open error"), &opts), Strategy::Tag);
    }

    #[test]
    fn test_free_text_shapes() {
        assert_eq!(route("file not found"), Strategy::Fts);
        assert_eq!(route("COBOL program S0C7 data exception"), Strategy::Hybrid);
        assert_eq!(route("sys1.proclib member"), Strategy::Hybrid);
        assert_eq!(route("io error"), Strategy::Fuzzy);
        assert_eq!(route("abend*"), Strategy::Fuzzy);
    }

    proptest! {
        #[test]
        fn prop_select_deterministic(q in "[a-zA-Z0-9 :.@*?-]{0,40}", with_cat in any::<bool>()) {
            let query = Query::parse(&q);
            let opts = if with_cat {
                SearchOptions::default().with_category("jcl")
            } else {
                SearchOptions::default()
            };
            prop_assert_eq!(select(&query, &opts), select(&Query::parse(&q), &opts.clone()));
        }

        #[test]
        fn prop_category_option_never_free_text(q in "[a-z ]{0,30}") {
            let opts = SearchOptions::default().with_category("jcl");
            let s = select(&Query::parse(&q), &opts);
            prop_assert!(s == Strategy::Category || s == Strategy::Exact);
        }
    }
}
