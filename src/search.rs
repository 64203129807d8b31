//! Resolve subset filters to index ranges along a dimension.
//!
//! A filter is either a single point (`"value"`) or a range (`"start<sep>end"`). In index mode
//! the tokens are raw 0-based indices, in value mode they are looked up in the (sorted)
//! coordinate array of the dimension.

use crate::error::{Error, Result};
use crate::types::Element;

/// How a target value that falls between two coordinates is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The numerically closest coordinate, ties favor the lower index.
    Nearest,
    /// The closest coordinate not above the target.
    LowerBound,
    /// The closest coordinate not below the target.
    UpperBound,
}

/// Find the index of `target` in the monotonic coordinate array `values`.
///
/// `offset` widens the target away from the range it bounds: it is subtracted for
/// `LowerBound` and added for `UpperBound` and `Nearest`. Returns the index together with
/// whether `values` is ascending. For descending arrays the caller must swap a resolved
/// start/end pair, see [`resolve_filter`].
pub fn index_by_value<T: Element>(
    values: &[T],
    target: T,
    policy: Policy,
    offset: T,
    tolerate_out_of_bound: bool,
) -> Result<(usize, bool)> {
    index_by_widened(
        values,
        target.widen(),
        policy,
        offset.widen(),
        tolerate_out_of_bound,
    )
}

/// [`index_by_value`] with the target and offset already widened, so fractional targets are
/// compared as given against integer coordinates.
fn index_by_widened<T: Element>(
    values: &[T],
    target: f64,
    policy: Policy,
    offset: f64,
    tolerate_out_of_bound: bool,
) -> Result<(usize, bool)> {
    let n = values.len();
    if n == 0 {
        return Err(Error::Param("empty coordinate array".into()));
    }

    let first = values[0].widen();
    let last = values[n - 1].widen();
    let ascending = first <= last;

    let target = match policy {
        Policy::LowerBound => target - offset,
        Policy::UpperBound | Policy::Nearest => target + offset,
    };

    let (min, max) = if ascending {
        (first, last)
    } else {
        (last, first)
    };

    // Position in ascending view `k` to stored index.
    let stored = |k: usize| if ascending { k } else { n - 1 - k };
    let at = |k: usize| values[stored(k)].widen();

    if target < min || target > max || target.is_nan() {
        if !tolerate_out_of_bound {
            return Err(Error::bound("coordinate", target, min, max));
        }

        let k = if target > max { n - 1 } else { 0 };
        return Ok((stored(k), ascending));
    }

    // first coordinate (in ascending view) which is not below target. exists since target <= max.
    let k = (0..n).find(|&k| at(k) >= target).unwrap_or(n - 1);
    let exact = at(k) == target;

    if exact {
        return Ok((stored(k), ascending));
    }

    let index = match policy {
        Policy::LowerBound => stored(k.saturating_sub(1)),
        Policy::UpperBound => stored(k.min(n - 1)),
        Policy::Nearest => {
            if k == 0 {
                stored(0)
            } else {
                let below = target - at(k - 1);
                let above = at(k) - target;

                if below < above {
                    stored(k - 1)
                } else if above < below {
                    stored(k)
                } else {
                    stored(k - 1).min(stored(k))
                }
            }
        }
    };

    Ok((index, ascending))
}

/// Build a `lookup` for [`resolve_filter`] over a coordinate array. Tokens are parsed as
/// floating point numbers and compared without narrowing to the coordinate type.
pub fn value_lookup<T: Element>(
    values: &[T],
    offset: T,
    tolerate_out_of_bound: bool,
) -> impl Fn(&str, Policy) -> Result<usize> + '_ {
    move |token: &str, policy: Policy| {
        let target: f64 = token
            .trim()
            .parse()
            .map_err(|_| Error::Param(format!("'{token}' is not a number")))?;

        let (index, _) = index_by_widened(
            values,
            target,
            policy,
            offset.widen(),
            tolerate_out_of_bound,
        )?;

        Ok(index)
    }
}

/// Resolve `filter` to an inclusive `(start, end)` index pair.
///
/// In index mode both tokens are non-negative integers and must be ordered. In value mode the
/// start token is resolved with `LowerBound`, the end token with `UpperBound` and a single
/// point with `Nearest`; a pair that comes out reversed (descending coordinates) is swapped.
pub fn resolve_filter<F>(
    filter: &str,
    separator: char,
    lookup: F,
    is_index_mode: bool,
) -> Result<(usize, usize)>
where
    F: Fn(&str, Policy) -> Result<usize>,
{
    let tokens = filter.split(separator).map(str::trim).collect::<Vec<_>>();

    if tokens.iter().any(|t| t.is_empty()) {
        return Err(Error::Param(format!("empty token in filter '{filter}'")));
    }

    let parse_index = |t: &str| {
        t.parse::<usize>()
            .map_err(|_| Error::Param(format!("'{t}' in filter '{filter}' is not an index")))
    };

    match (tokens.as_slice(), is_index_mode) {
        (&[point], true) => {
            let i = parse_index(point)?;
            Ok((i, i))
        }
        (&[point], false) => {
            let i = lookup(point, Policy::Nearest)?;
            Ok((i, i))
        }
        (&[start, end], true) => {
            let (s, e) = (parse_index(start)?, parse_index(end)?);
            if s > e {
                return Err(Error::Param(format!(
                    "filter '{filter}' starts after it ends"
                )));
            }
            Ok((s, e))
        }
        (&[start, end], false) => {
            let s = lookup(start, Policy::LowerBound)?;
            let e = lookup(end, Policy::UpperBound)?;
            Ok(if s > e { (e, s) } else { (s, e) })
        }
        _ => Err(Error::Param(format!(
            "strided filter '{filter}' is not supported"
        ))),
    }
}
