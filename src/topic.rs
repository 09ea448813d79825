//! Topic names, filters, and wildcard matching
//!
//! Topics are `/`-separated UTF-8 paths. Filters may use `+` to match
//! exactly one part and `#` to match any number of trailing parts. Both
//! wildcards must stand alone in their part, and `#` may only appear last.

/// True when the string contains either wildcard character anywhere.
///
/// Used both to route filters into the wildcard list and to reject PUBLISH
/// topics that try to smuggle wildcards in.
pub fn is_wildcard(topic: &str) -> bool {
    topic.contains('#') || topic.contains('+')
}

/// Check filter well-formedness: a part containing `+` or `#` must be
/// exactly that token, and `#` is only legal as the final part.
pub fn valid_filter<P: AsRef<str>>(parts: &[P]) -> bool {
    let len = parts.len();
    for (i, part) in parts.iter().enumerate() {
        let part = part.as_ref();
        // catch things like finance#
        if is_wildcard(part) && part.len() != 1 {
            return false;
        }
        if part == "#" && i != len - 1 {
            return false;
        }
    }
    true
}

/// Match a topic against a filter, both pre-split into parts.
///
/// `+` consumes one topic part (the empty part included); `#` consumes all
/// remaining parts and also matches the parent itself, so `a/b/#` matches
/// `a/b`. Comparison is case-sensitive.
pub fn filter_matches<F, T>(filter: &[F], topic: &[T]) -> bool
where
    F: AsRef<str>,
    T: AsRef<str>,
{
    if filter.is_empty() {
        return topic.is_empty();
    }

    let mut i = 0;
    while i < topic.len() {
        // topic is longer, no match
        if i >= filter.len() {
            return false;
        }
        let part = filter[i].as_ref();
        // matched up to here, and the wildcard takes everything after
        if part == "#" {
            return true;
        }
        if part != "+" && part != topic[i].as_ref() {
            return false;
        }
        i += 1;
    }

    // make finance/stock/ibm/# match finance/stock/ibm
    if i == filter.len() - 1 && filter[filter.len() - 1].as_ref() == "#" {
        return true;
    }

    i == filter.len()
}

/// Convenience form taking unsplit strings.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();
    filter_matches(&filter_parts, &topic_parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("#"));
        assert!(is_wildcard("a/+/b"));
        assert!(is_wildcard("finance#"));
        assert!(!is_wildcard("finance/stock/ibm"));
        assert!(!is_wildcard(""));
    }

    #[test]
    fn test_valid_filter() {
        let split = |s: &str| s.split('/').map(str::to_owned).collect::<Vec<_>>();

        assert!(valid_filter(&split("a/b/c")));
        assert!(valid_filter(&split("+")));
        assert!(valid_filter(&split("#")));
        assert!(valid_filter(&split("a/+/c")));
        assert!(valid_filter(&split("a/b/#")));
        assert!(valid_filter(&split("+/+/+")));

        assert!(!valid_filter(&split("finance#")));
        assert!(!valid_filter(&split("finance/sto+ck")));
        assert!(!valid_filter(&split("a/#/c")));
        assert!(!valid_filter(&split("#/a")));
    }

    #[test]
    fn test_exact_matching() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(topic_matches_filter("a", "a"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b", "a/B"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches_filter("sport/tennis/player1", "sport/+/player1"));
        assert!(!topic_matches_filter("sport/tennis/player2", "sport/+/player1"));
        assert!(topic_matches_filter("a/b", "+/+"));
        assert!(!topic_matches_filter("a", "+/+"));
        assert!(!topic_matches_filter("a/b/c", "+/+"));
        // + matches the empty part
        assert!(topic_matches_filter("a//c", "a/+/c"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches_filter("finance/stock/ibm", "finance/stock/ibm/#"));
        assert!(topic_matches_filter("finance/stock/ibm/closing", "finance/stock/ibm/#"));
        assert!(topic_matches_filter("finance/stock/ibm/a/b", "finance/stock/ibm/#"));
        assert!(!topic_matches_filter("finance/stock", "finance/stock/ibm/#"));
        assert!(topic_matches_filter("anything/at/all", "#"));
        assert!(topic_matches_filter("anything", "#"));
    }

    #[test]
    fn test_empty_filter_never_matches() {
        let empty: &[&str] = &[];
        assert!(!filter_matches(empty, &["a"]));
        assert!(!filter_matches(empty, &["a", "b"]));
    }
}
