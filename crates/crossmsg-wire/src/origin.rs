//! Origin policy predicates.
//!
//! Pure functions: nothing here performs I/O, and absence is represented
//! with `Option` / `false` rather than signalled as an error.

use crossmsg_types::WILDCARD_ORIGIN;
use url::Url;

/// Scheme pairs `(secure, insecure)` of the same transport family.
const DOWNGRADE_PAIRS: &[(&str, &str)] = &[("https", "http"), ("wss", "ws")];

/// Derive the serialized origin (`scheme://host[:port]`) of a URL-like string.
///
/// Absolute URLs are parsed directly; anything else is resolved against
/// `base`. URLs with an opaque origin (`about:blank`, `data:`) have no
/// usable origin and yield `None`.
pub fn derive_origin(url_like: &str, base: Option<&Url>) -> Option<String> {
    let url = match Url::parse(url_like) {
        Ok(url) => url,
        Err(_) => base?.join(url_like).ok()?,
    };
    let origin = url.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}

/// Whether sending from a `current_scheme` context to `target_origin` would
/// downgrade from a secure transport to its insecure counterpart.
pub fn forbids_downgrade(current_scheme: &str, target_origin: &str) -> bool {
    let Some((target_scheme, _)) = target_origin.split_once(':') else {
        return false;
    };
    let current = current_scheme.trim_end_matches(':').to_ascii_lowercase();
    let target = target_scheme.to_ascii_lowercase();
    DOWNGRADE_PAIRS
        .iter()
        .any(|(secure, insecure)| current == *secure && target == *insecure)
}

/// Human-readable reason attached to a downgrade rejection.
pub fn downgrade_reason(current_scheme: &str, target_origin: &str) -> String {
    format!(
        "a {current_scheme} context cannot message the insecure origin {target_origin} \
         (mixed content). Serve the target over a secure scheme, or run both sides insecurely"
    )
}

/// Whether `observed` is accepted by `allow_list`.
pub fn is_allowed_origin<S: AsRef<str>>(observed: &str, allow_list: &[S]) -> bool {
    allow_list
        .iter()
        .any(|allowed| allowed.as_ref() == WILDCARD_ORIGIN || allowed.as_ref() == observed)
}

/// Whether `origin` is the wildcard.
pub fn is_wildcard(origin: &str) -> bool {
    origin == WILDCARD_ORIGIN
}
