//! Topic pattern matching.
//!
//! Topics are `:`-delimited.  Wildcard tokens:
//! - `*` matches exactly one segment
//! - `++` matches one or more segments
//! - `**` matches zero or more segments
//!
//! Non-wildcard tokens match themselves.  Every wildcard token yields one
//! capture, in left-to-right order; multi-segment captures join their
//! segments back with `:`.

const DELIMITER: char = ':';

/// Match a concrete topic against a pattern.
///
/// Returns `Some(captures)` on a match, `None` otherwise.  A concrete topic
/// with no wildcard matches itself with an empty capture list.
pub fn match_topic(concrete: &str, pattern: &str) -> Option<Vec<String>> {
    let topic: Vec<&str> = concrete.split(DELIMITER).collect();
    let pat: Vec<&str> = pattern.split(DELIMITER).collect();
    let mut captures = Vec::new();
    if match_segments(&topic, &pat, &mut captures) {
        Some(captures)
    } else {
        None
    }
}

fn match_segments(topic: &[&str], pat: &[&str], captures: &mut Vec<String>) -> bool {
    let Some((&head, rest)) = pat.split_first() else {
        return topic.is_empty();
    };
    match head {
        "*" => {
            let Some((&seg, topic_rest)) = topic.split_first() else {
                return false;
            };
            captures.push(seg.to_owned());
            if match_segments(topic_rest, rest, captures) {
                return true;
            }
            captures.pop();
            false
        }
        "**" => match_span(topic, rest, captures, 0),
        "++" => match_span(topic, rest, captures, 1),
        literal => match topic.split_first() {
            Some((&seg, topic_rest)) if seg == literal => {
                match_segments(topic_rest, rest, captures)
            }
            _ => false,
        },
    }
}

/// Try a multi-segment wildcard spanning `min`..=all remaining segments,
/// longest span first.
fn match_span(topic: &[&str], rest: &[&str], captures: &mut Vec<String>, min: usize) -> bool {
    for take in (min..=topic.len()).rev() {
        captures.push(topic[..take].join(":"));
        if match_segments(&topic[take..], rest, captures) {
            return true;
        }
        captures.pop();
    }
    false
}

/// Scalar ordering protected room patterns from most to least specific.
///
/// Literal tokens weigh most, then `*`, `++`, `**`; weights are summed per
/// token so deeper literal patterns outrank shallow ones.  Equal scores are
/// tie-broken by declaration order (callers sort stably).
pub fn specificity(pattern: &str) -> u32 {
    pattern
        .split(DELIMITER)
        .map(|token| match token {
            "**" => 0,
            "++" => 1,
            "*" => 2,
            _ => 3,
        })
        .sum()
}

/// Whether the pattern contains any wildcard character (`*` or `+`).
pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('+')
}
