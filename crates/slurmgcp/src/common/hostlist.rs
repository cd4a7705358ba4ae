//! Slurm hostlist expressions, e.g. `c-n-[0-3,7],c-gpu-00[1-2]`.

use crate::common::parser::{CharParser, ParseError, all_consuming, parse_digits};
use chumsky::Parser;
use chumsky::primitive::{just, none_of};
use std::collections::{BTreeMap, BTreeSet};

/// Inclusive range of suffixes, `width` is the zero padded length.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SuffixRange {
    start: u64,
    end: u64,
    width: usize,
}

impl SuffixRange {
    fn iter(&self) -> impl Iterator<Item = String> + '_ {
        (self.start..=self.end).map(|n| format!("{n:0width$}", width = self.width))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Ranges(Vec<SuffixRange>),
}

fn parse_range() -> impl CharParser<SuffixRange> {
    let start = parse_digits().labelled("start");
    let end = just('-').ignore_then(parse_digits()).labelled("end").or_not();

    start
        .then(end)
        .try_map(|(start, end), span| {
            let width = start.len();
            let value = |digits: &str| {
                digits
                    .parse::<u64>()
                    .map_err(|_| ParseError::custom(span.clone(), "Number is too large"))
            };
            let first = value(&start)?;
            let last = match &end {
                Some(end) => value(end)?,
                None => first,
            };
            if last < first {
                return Err(ParseError::custom(span, "Invalid range"));
            }
            Ok(SuffixRange {
                start: first,
                end: last,
                width,
            })
        })
        .labelled("range")
}

fn parse_segment() -> impl CharParser<Segment> {
    let text = none_of("[],")
        .repeated()
        .at_least(1)
        .collect::<String>()
        .map(Segment::Text);
    let ranges = parse_range()
        .separated_by(just(','))
        .at_least(1)
        .delimited_by(just('['), just(']'))
        .map(Segment::Ranges);
    text.or(ranges)
}

fn parse_hostlist_inner() -> impl CharParser<Vec<Vec<Segment>>> {
    all_consuming(
        parse_segment()
            .repeated()
            .at_least(1)
            .labelled("host")
            .separated_by(just(','))
            .allow_trailing(),
    )
}

fn expand_item(segments: &[Segment], output: &mut Vec<String>) {
    let mut names = vec![String::new()];
    for segment in segments {
        names = match segment {
            Segment::Text(text) => names
                .into_iter()
                .map(|mut name| {
                    name.push_str(text);
                    name
                })
                .collect(),
            Segment::Ranges(ranges) => names
                .iter()
                .flat_map(|name| {
                    ranges
                        .iter()
                        .flat_map(|range| range.iter())
                        .map(move |suffix| format!("{name}{suffix}"))
                })
                .collect(),
        };
    }
    output.extend(names);
}

/// Expands a hostlist into host names. Order of the expression is kept, duplicates are dropped.
pub fn expand_hostlist(hostlist: &str) -> anyhow::Result<Vec<String>> {
    let hostlist = hostlist.trim();
    if hostlist.is_empty() {
        return Ok(Vec::new());
    }
    let items = parse_hostlist_inner().parse_text(hostlist)?;
    let mut names = Vec::new();
    for item in &items {
        expand_item(item, &mut names);
    }
    let mut seen = BTreeSet::new();
    names.retain(|name| seen.insert(name.clone()));
    Ok(names)
}

/// Expands several hostlists (e.g. positional arguments) at once.
pub fn expand_hostlists<S: AsRef<str>>(hostlists: &[S]) -> anyhow::Result<Vec<String>> {
    expand_hostlist(
        &hostlists
            .iter()
            .map(|h| h.as_ref())
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Splits a name into a prefix and its trailing digits.
fn split_suffix(name: &str) -> (&str, &str) {
    let split = name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(index, _)| index)
        .unwrap_or(name.len());
    name.split_at(split)
}

/// Compresses suffixes of the same length into ranges like `1-3`.
fn compress_suffixes(suffixes: &BTreeSet<&str>) -> Vec<String> {
    let mut result = Vec::new();
    let mut current: Option<(u64, &str, &str)> = None;
    let repr = |(_, first, last): (u64, &str, &str)| {
        if first == last {
            first.to_string()
        } else {
            format!("{first}-{last}")
        }
    };
    // All suffixes have the same length, so the string order is the numeric order.
    for (suffix, value) in suffixes
        .iter()
        .copied()
        .filter_map(|suffix| Some((suffix, suffix.parse::<u64>().ok()?)))
    {
        current = match current {
            Some((last_value, first, _)) if last_value.checked_add(1) == Some(value) => {
                Some((value, first, suffix))
            }
            Some(cur) => {
                result.push(repr(cur));
                Some((value, suffix, suffix))
            }
            None => Some((value, suffix, suffix)),
        };
    }
    if let Some(cur) = current {
        result.push(repr(cur));
    }
    result
}

/// Creates a hostlist expression from host names.
///
/// The result is sorted by prefix and suffix (like `scontrol show hostlistsorted`),
/// the original order of names is not preserved.
pub fn compress_hostlist<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> String {
    let mut by_prefix: BTreeMap<String, BTreeMap<usize, BTreeSet<String>>> = BTreeMap::new();
    let mut literals = BTreeSet::new();
    for name in names {
        let name = name.as_ref();
        if name.is_empty() {
            continue;
        }
        let (prefix, suffix) = split_suffix(name);
        if suffix.parse::<u64>().is_err() && !suffix.is_empty() {
            // Cannot be a range bound, kept as a plain name
            literals.insert(name.to_string());
            continue;
        }
        by_prefix
            .entry(prefix.to_string())
            .or_default()
            .entry(suffix.len())
            .or_default()
            .insert(suffix.to_string());
    }

    let mut result = Vec::new();
    for (prefix, by_len) in &by_prefix {
        let mut compressed = Vec::new();
        for (len, suffixes) in by_len {
            if *len == 0 {
                result.push(prefix.clone());
            } else {
                let suffixes: BTreeSet<&str> = suffixes.iter().map(|s| s.as_str()).collect();
                compressed.extend(compress_suffixes(&suffixes));
            }
        }
        match compressed.as_slice() {
            [] => {}
            [single] if !single.contains('-') => result.push(format!("{prefix}{single}")),
            _ => result.push(format!("{prefix}[{}]", compressed.join(","))),
        }
    }
    result.extend(literals);
    result.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::expect_parser_error;

    #[test]
    fn expand_single_names() {
        assert_eq!(expand_hostlist("c-n-1").unwrap(), vec!["c-n-1"]);
        assert_eq!(
            expand_hostlist("c-n-1,c-m-2").unwrap(),
            vec!["c-n-1", "c-m-2"]
        );
        assert!(expand_hostlist("").unwrap().is_empty());
    }

    #[test]
    fn expand_ranges() {
        assert_eq!(
            expand_hostlist("c-n-[0-3]").unwrap(),
            vec!["c-n-0", "c-n-1", "c-n-2", "c-n-3"]
        );
        assert_eq!(
            expand_hostlist("c-n-[1,3-4],c-x-7").unwrap(),
            vec!["c-n-1", "c-n-3", "c-n-4", "c-x-7"]
        );
    }

    #[test]
    fn expand_zero_padded() {
        assert_eq!(
            expand_hostlist("c-n-[08-10]").unwrap(),
            vec!["c-n-08", "c-n-09", "c-n-10"]
        );
    }

    #[test]
    fn expand_multiple_groups() {
        assert_eq!(
            expand_hostlist("r[1-2]-n[0-1]").unwrap(),
            vec!["r1-n0", "r1-n1", "r2-n0", "r2-n1"]
        );
    }

    #[test]
    fn expand_drops_duplicates() {
        assert_eq!(
            expand_hostlist("c-n-[1-2],c-n-2").unwrap(),
            vec!["c-n-1", "c-n-2"]
        );
    }

    #[test]
    fn expand_invalid_range() {
        assert!(expand_hostlist("c-n-[3-1]").is_err());
        insta::assert_snapshot!(expect_parser_error(parse_hostlist_inner(), "c-n-[1-x]"), @r###"
        Invalid number: unexpected `x`
          c-n-[1-x]
                 ^
        "###);
    }

    #[test]
    fn compress_names() {
        assert_eq!(
            compress_hostlist(["c-n-3", "c-n-1", "c-n-2", "c-n-7"]),
            "c-n-[1-3,7]"
        );
        assert_eq!(compress_hostlist(["c-n-3"]), "c-n-3");
        assert_eq!(compress_hostlist(["c-n-3", "c-n-4"]), "c-n-[3-4]");
        assert_eq!(compress_hostlist(Vec::<String>::new()), "");
    }

    #[test]
    fn compress_mixed_prefixes() {
        assert_eq!(
            compress_hostlist(["b-x-1", "a-y-10", "a-y-9", "a-y-11", "login"]),
            "a-y-[9,10-11],b-x-1,login"
        );
    }

    #[test]
    fn compress_keeps_padding() {
        assert_eq!(
            compress_hostlist(["n08", "n09", "n10", "n1"]),
            "n[1,08-10]"
        );
    }

    #[test]
    fn hostlist_round_trip() {
        let names: Vec<String> = (0..40)
            .filter(|i| i % 7 != 3)
            .map(|i| format!("c-ns{}-{i}", i % 3))
            .chain(["c-ns0-007".to_string(), "c-other-x".to_string()])
            .collect();
        let compressed = compress_hostlist(&names);
        let expanded: BTreeSet<String> = expand_hostlist(&compressed).unwrap().into_iter().collect();
        let original: BTreeSet<String> = names.into_iter().collect();
        assert_eq!(expanded, original);
    }

    #[test]
    fn oversized_suffix_round_trip() {
        let huge = "c-n-123456789012345678901234567890".to_string();
        let names = vec!["c-n-1".to_string(), "c-n-2".to_string(), huge.clone()];
        let compressed = compress_hostlist(&names);
        assert_eq!(compressed, format!("c-n-[1-2],{huge}"));
        assert_eq!(expand_hostlist(&compressed).unwrap(), names);
    }

    #[test]
    fn split_name_suffix() {
        assert_eq!(split_suffix("c-n-12"), ("c-n-", "12"));
        assert_eq!(split_suffix("login"), ("login", ""));
        assert_eq!(split_suffix("42"), ("", "42"));
    }
}
