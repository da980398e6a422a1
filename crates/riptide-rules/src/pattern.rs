use indexmap::IndexMap;

use riptide_protocol::{EngineError, EngineResult};

/// Variables captured while matching a pattern, in declaration order.
pub type Bindings = IndexMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
    CaptureTail(String),
    PrefixWildcard,
}

/// A compiled path pattern.
///
/// Grammar: literal segments match equal path segments; `{name}` captures one
/// segment; `{name=**}` captures the remainder of the path and must be the
/// final segment; a trailing `/**` matches any proper-prefix path without
/// binding anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(EngineError::malformed("empty rule pattern"));
        }
        let mut segments = Vec::new();
        for part in trimmed.split('/') {
            let segment = if part == "**" {
                Segment::PrefixWildcard
            } else if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                match inner.split_once('=') {
                    Some((name, "**")) => Segment::CaptureTail(validate_name(raw, name)?),
                    Some(_) => {
                        return Err(EngineError::malformed(format!(
                            "unsupported capture form in pattern {raw:?}"
                        )));
                    }
                    None => Segment::Capture(validate_name(raw, inner)?),
                }
            } else if part.is_empty() {
                return Err(EngineError::malformed(format!(
                    "pattern contains an empty segment: {raw:?}"
                )));
            } else {
                Segment::Literal(part.to_owned())
            };
            segments.push(segment);
        }
        for (index, segment) in segments.iter().enumerate() {
            let terminal = matches!(
                segment,
                Segment::CaptureTail(_) | Segment::PrefixWildcard
            );
            if terminal && index + 1 != segments.len() {
                return Err(EngineError::malformed(format!(
                    "wildcard must be the final segment in pattern {raw:?}"
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Match a path, returning the captured bindings on success.
    pub fn matches(&self, path: &[String]) -> Option<Bindings> {
        let mut bindings = Bindings::new();
        let mut remaining = path;
        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    let (head, tail) = remaining.split_first()?;
                    if head != literal {
                        return None;
                    }
                    remaining = tail;
                }
                Segment::Capture(name) => {
                    let (head, tail) = remaining.split_first()?;
                    bindings.insert(name.clone(), head.clone());
                    remaining = tail;
                }
                Segment::CaptureTail(name) => {
                    if remaining.is_empty() {
                        return None;
                    }
                    bindings.insert(name.clone(), remaining.join("/"));
                    return Some(bindings);
                }
                Segment::PrefixWildcard => {
                    // `/**` requires a proper prefix: at least one more segment.
                    debug_assert_eq!(index + 1, self.segments.len());
                    if remaining.is_empty() {
                        return None;
                    }
                    return Some(bindings);
                }
            }
        }
        if remaining.is_empty() {
            Some(bindings)
        } else {
            None
        }
    }
}

fn validate_name(pattern: &str, name: &str) -> EngineResult<String> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(EngineError::malformed(format!(
            "invalid capture name {name:?} in pattern {pattern:?}"
        )));
    }
    Ok(name.to_owned())
}
