use crate::error::RyeError;
use crate::intern::{resolve, sym, with_resolved, Spur};
use crate::value::{Arg, Formal, Value};

/// How one formal ends up bound at closure entry.
#[derive(Debug)]
pub enum Binding {
    /// A supplied actual (usually a promise).
    Supplied(Value),
    /// Nothing supplied; the caller decides between the default expression
    /// and the missing token.
    Missing,
    /// The `...` formal with its collected leftovers.
    Dots(Vec<Arg>),
}

/// Match actuals against formals: exact tag match, then unique partial
/// prefix match (only up to `...`), then positional fill. Leftovers go to
/// `...` when present, otherwise they are an error.
pub fn match_args(formals: &[Formal], actuals: &[Arg]) -> Result<Vec<(Spur, Binding)>, RyeError> {
    let dots_pos = formals.iter().position(|f| f.name == sym::dots());
    let mut supplied: Vec<Option<&Arg>> = vec![None; formals.len()];
    let mut used = vec![false; actuals.len()];

    // Pass 1: exact tag matches.
    for (ai, actual) in actuals.iter().enumerate() {
        let Some(tag) = actual.tag else { continue };
        if tag == sym::dots() {
            continue;
        }
        if let Some(fi) = formals.iter().position(|f| f.name == tag) {
            if supplied[fi].is_some() {
                return Err(RyeError::eval(format!(
                    "formal argument \"{}\" matched by multiple actual arguments",
                    resolve(tag)
                )));
            }
            supplied[fi] = Some(actual);
            used[ai] = true;
        }
    }

    // Pass 2: unique partial matches, only for formals before `...`.
    let partial_limit = dots_pos.unwrap_or(formals.len());
    for (ai, actual) in actuals.iter().enumerate() {
        if used[ai] {
            continue;
        }
        let Some(tag) = actual.tag else { continue };
        let matches: Vec<usize> = with_resolved(tag, |tag_str| {
            formals[..partial_limit]
                .iter()
                .enumerate()
                .filter(|(fi, f)| {
                    supplied[*fi].is_none()
                        && with_resolved(f.name, |name| name.starts_with(tag_str))
                })
                .map(|(fi, _)| fi)
                .collect()
        });
        match matches.len() {
            0 => {}
            1 => {
                supplied[matches[0]] = Some(actual);
                used[ai] = true;
            }
            _ => {
                return Err(RyeError::eval(format!(
                    "argument \"{}\" matches multiple formal arguments",
                    resolve(tag)
                )))
            }
        }
    }

    // Pass 3: positional fill of untagged actuals, up to `...`.
    let mut fi = 0;
    for (ai, actual) in actuals.iter().enumerate() {
        if used[ai] || actual.tag.is_some() {
            continue;
        }
        while fi < partial_limit && (supplied[fi].is_some() || formals[fi].name == sym::dots()) {
            fi += 1;
        }
        if fi >= partial_limit {
            break;
        }
        supplied[fi] = Some(actual);
        used[ai] = true;
        fi += 1;
    }

    // Leftovers: collected by `...` or rejected.
    let leftovers: Vec<Arg> = actuals
        .iter()
        .enumerate()
        .filter(|(ai, _)| !used[*ai])
        .map(|(_, a)| a.clone())
        .collect();
    if dots_pos.is_none() {
        if let Some(extra) = leftovers.first() {
            return Err(RyeError::eval(format!(
                "unused argument ({})",
                match extra.tag {
                    Some(t) => resolve(t),
                    None => extra.value.deparse(),
                }
            )));
        }
    }

    Ok(formals
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let binding = if Some(i) == dots_pos {
                Binding::Dots(leftovers.clone())
            } else {
                match supplied[i] {
                    Some(a) => Binding::Supplied(a.value.clone()),
                    None => Binding::Missing,
                }
            };
            (f.name, binding)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;

    fn formal(name: &str) -> Formal {
        Formal {
            name: intern(name),
            default: None,
        }
    }

    #[test]
    fn test_positional() {
        let formals = [formal("x"), formal("y")];
        let actuals = [Arg::pos(Value::real(1.0)), Arg::pos(Value::real(2.0))];
        let m = match_args(&formals, &actuals).unwrap();
        assert!(matches!(&m[0].1, Binding::Supplied(v) if v.as_real_scalar() == Some(1.0)));
        assert!(matches!(&m[1].1, Binding::Supplied(v) if v.as_real_scalar() == Some(2.0)));
    }

    #[test]
    fn test_exact_name_reorders() {
        let formals = [formal("x"), formal("y")];
        let actuals = [
            Arg::named(intern("y"), Value::real(1.0)),
            Arg::pos(Value::real(2.0)),
        ];
        let m = match_args(&formals, &actuals).unwrap();
        assert!(matches!(&m[0].1, Binding::Supplied(v) if v.as_real_scalar() == Some(2.0)));
        assert!(matches!(&m[1].1, Binding::Supplied(v) if v.as_real_scalar() == Some(1.0)));
    }

    #[test]
    fn test_partial_match() {
        let formals = [formal("verbose")];
        let actuals = [Arg::named(intern("verb"), Value::lgl(true))];
        let m = match_args(&formals, &actuals).unwrap();
        assert!(matches!(&m[0].1, Binding::Supplied(_)));
    }

    #[test]
    fn test_dots_collects_leftovers() {
        let formals = [formal("x"), formal("...")];
        let actuals = [
            Arg::pos(Value::real(1.0)),
            Arg::pos(Value::real(2.0)),
            Arg::named(intern("z"), Value::real(3.0)),
        ];
        let m = match_args(&formals, &actuals).unwrap();
        match &m[1].1 {
            Binding::Dots(rest) => {
                assert_eq!(rest.len(), 2);
                assert_eq!(rest[1].tag, Some(intern("z")));
            }
            other => panic!("expected dots binding, got {:?}", other),
        }
    }

    #[test]
    fn test_unused_argument_rejected() {
        let formals = [formal("x")];
        let actuals = [Arg::pos(Value::real(1.0)), Arg::pos(Value::real(2.0))];
        assert!(match_args(&formals, &actuals).is_err());
    }

    #[test]
    fn test_missing_formal() {
        let formals = [formal("x"), formal("y")];
        let actuals = [Arg::pos(Value::real(1.0))];
        let m = match_args(&formals, &actuals).unwrap();
        assert!(matches!(&m[1].1, Binding::Missing));
    }

    #[test]
    fn test_no_partial_match_after_dots() {
        let formals = [formal("..."), formal("verbose")];
        let actuals = [Arg::named(intern("verb"), Value::lgl(true))];
        let m = match_args(&formals, &actuals).unwrap();
        // "verb" must not partially match past `...`; it lands in the dots
        assert!(matches!(&m[1].1, Binding::Missing));
        assert!(matches!(&m[0].1, Binding::Dots(rest) if rest.len() == 1));
    }
}
