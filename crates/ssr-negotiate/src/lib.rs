//! RFC 9110 content-negotiation parsing (§4.4).
//!
//! Three independent parsers, each turning a raw header value into a
//! weighted list and then picking a winner against a caller-supplied set of
//! candidates. None of them touch a request or response directly — callers
//! own the HTTP types and decide how to surface `None`/`Err` as a status
//! code and a `Vary` header.

use std::cmp::Ordering;

/// One coding or media-range parsed out of a header, with its `q` weight.
///
/// `q` defaults to `1.0` when the header omits it. Values are clamped to
/// `[0.0, 1.0]` per RFC 9110 §12.4.2; a weight of exactly `0` means the
/// client explicitly excludes the candidate.
#[derive(Debug, Clone, PartialEq)]
struct Weighted<T> {
    value: T,
    q: f32,
}

/// Parse a comma-separated `name[;q=value]` list, preserving header order
/// for later tie-breaking. Unparseable `q` values fall back to `1.0` rather
/// than rejecting the whole entry — a buggy client shouldn't take down
/// negotiation for an otherwise-fine request.
fn parse_weighted_list(header: &str) -> Vec<Weighted<String>> {
    header
        .split(',')
        .filter_map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            let mut parts = item.split(';');
            let value = parts.next()?.trim().to_string();
            let mut q = 1.0f32;
            for param in parts {
                let param = param.trim();
                if let Some(raw) = param.strip_prefix("q=") {
                    q = raw.trim().parse().unwrap_or(1.0);
                }
            }
            Some(Weighted {
                value,
                q: q.clamp(0.0, 1.0),
            })
        })
        .collect()
}

/// Pick the highest-weighted content-coding present in `supported`.
/// `identity` is an implicit candidate at weight `1.0` when the header is
/// absent, when the header carries a `*` entry, or when it names `identity`
/// explicitly with a nonzero weight. A header that is present but names
/// neither `identity` nor `*` does not grant `identity` an implicit pass —
/// a client that lists only codings this server doesn't support must get
/// "nothing acceptable," not a silent `identity` fallback.
///
/// Returns `None` if every supported coding (including `identity`) is
/// excluded — the caller should surface this as 415 with an
/// `Accept-Encoding` header listing `supported`.
pub fn negotiate_encoding<'a>(header: Option<&str>, supported: &[&'a str]) -> Option<&'a str> {
    let Some(header) = header else {
        return supported.first().copied().or(Some("identity"));
    };

    let weighted = parse_weighted_list(header);
    let explicit = |name: &str| weighted.iter().find(|w| w.value == name || w.value == "*");

    let identity_q = match explicit("identity") {
        Some(w) => w.q,
        None => 0.0,
    };

    let mut best: Option<(&str, f32)> = None;
    for &candidate in supported {
        let q = match explicit(candidate) {
            Some(w) => w.q,
            None if candidate == "identity" => identity_q,
            None => 0.0,
        };
        if q <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_q)) if best_q >= q => {}
            _ => best = Some((candidate, q)),
        }
    }

    best.map(|(name, _)| name)
}

/// Parse a media range's type/subtype and named parameters, lowercasing the
/// type and subtype per §4.4's Content-Type rule. Parameter keys are
/// lowercased too; values are left as-is since they may be case-sensitive
/// (e.g. `charset=UTF-8` vs `charset=utf-8` are the same charset, but other
/// parameters aren't guaranteed to be).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub ty: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
}

impl MediaType {
    /// Parse a single `type/subtype[;k=v...]` media type. Returns `None` on
    /// malformed input (missing `/`, empty type or subtype) — the caller
    /// surfaces this as HTTP 400.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split(';');
        let type_subtype = parts.next()?.trim();
        let (ty, subtype) = type_subtype.split_once('/')?;
        if ty.is_empty() || subtype.is_empty() {
            return None;
        }
        let params = parts
            .filter_map(|p| {
                let p = p.trim();
                let (k, v) = p.split_once('=')?;
                Some((k.trim().to_lowercase(), v.trim().to_string()))
            })
            .collect();
        Some(MediaType {
            ty: ty.to_lowercase(),
            subtype: subtype.to_lowercase(),
            params,
        })
    }

    fn matches_range(&self, range: &MediaType) -> bool {
        let ty_ok = range.ty == "*" || range.ty == self.ty;
        let subtype_ok = range.subtype == "*" || range.subtype == self.subtype;
        ty_ok && subtype_ok
    }

    fn specificity(&self) -> u8 {
        match (self.ty.as_str(), self.subtype.as_str()) {
            ("*", "*") => 0,
            (_, "*") => 1,
            _ => 2,
        }
    }
}

/// Parse an `Accept` header into weighted media ranges, most-specific and
/// highest-weighted first. Malformed ranges are skipped rather than
/// rejecting the whole header.
fn parse_accept(header: &str) -> Vec<Weighted<MediaType>> {
    header
        .split(',')
        .filter_map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            let mut parts = item.split(';');
            let type_subtype = parts.next()?.trim();
            let (ty, subtype) = type_subtype.split_once('/')?;
            let mut q = 1.0f32;
            let mut params = Vec::new();
            for param in parts {
                let param = param.trim();
                if let Some((k, v)) = param.split_once('=') {
                    let k = k.trim();
                    let v = v.trim();
                    if k.eq_ignore_ascii_case("q") {
                        q = v.parse().unwrap_or(1.0);
                    } else {
                        params.push((k.to_lowercase(), v.to_string()));
                    }
                }
            }
            Some(Weighted {
                value: MediaType {
                    ty: ty.trim().to_lowercase(),
                    subtype: subtype.trim().to_lowercase(),
                    params,
                },
                q: q.clamp(0.0, 1.0),
            })
        })
        .collect()
}

/// Pick the best offer from `offers` (given in the caller's preference
/// order) against a parsed `Accept` header. Ties in weight and specificity
/// are broken by the caller's order — the first offer in `offers` wins.
///
/// Returns `None` if nothing in `offers` is acceptable — the caller
/// surfaces this as HTTP 406 with an `Accept` header listing `offers`.
pub fn negotiate_media_type<'a>(header: Option<&str>, offers: &'a [MediaType]) -> Option<&'a MediaType> {
    let Some(header) = header else {
        return offers.first();
    };

    let ranges = parse_accept(header);
    if ranges.is_empty() {
        return offers.first();
    }

    let mut best: Option<(&MediaType, f32, u8)> = None;
    for offer in offers {
        let mut matched: Option<(f32, u8)> = None;
        for range in &ranges {
            if offer.matches_range(&range.value) && range.q > 0.0 {
                let specificity = range.value.specificity();
                match matched {
                    Some((q, spec)) if q > range.q || (q == range.q && spec >= specificity) => {}
                    _ => matched = Some((range.q, specificity)),
                }
            }
        }
        if let Some((q, specificity)) = matched {
            match best {
                Some((_, best_q, best_spec)) if best_q > q || (best_q == q && best_spec >= specificity) => {}
                _ => best = Some((offer, q, specificity)),
            }
        }
    }

    best.map(|(offer, _, _)| offer)
}

/// Build the `Vary` header value for a response whose body depended on
/// negotiating the given request headers.
pub fn vary_header(inspected: &[&str]) -> String {
    inspected.join(", ")
}
