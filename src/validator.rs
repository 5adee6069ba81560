//! Stateless checkers: key/size/metadata limits, precondition evaluation,
//! range parsing, digest comparison.
//!
//! Grounded on the teacher's `handlers/object.rs` range-parsing and
//! conditional-request helpers (`parse_range_header`, `resolve_range`,
//! the If-Match/If-None-Match/If-Modified-Since/If-Unmodified-Since
//! check), generalized to the structured range form and the full
//! precondition algebra this spec calls for.

use crate::blob::ByteRange;
use crate::errors::{EngineError, EngineResult};
use crate::model::{CustomMetadata, DigestAlgorithm, ObjectMeta};

/// `key(k)`: 1..=max_len bytes, else `InvalidObjectName`.
pub fn validate_key(key: &str, max_len: usize) -> EngineResult<()> {
    let len = key.len();
    if len == 0 || len > max_len {
        return Err(EngineError::InvalidObjectName);
    }
    Ok(())
}

/// `size(n)`: <= max, else `EntityTooLarge`.
pub fn validate_size(n: u64, max: u64) -> EngineResult<()> {
    if n > max {
        return Err(EngineError::EntityTooLarge);
    }
    Ok(())
}

/// Per §4.3: a code point < 256 costs 1 serialised byte, otherwise 2.
fn serialised_len(s: &str) -> usize {
    s.chars()
        .map(|c| if (c as u32) < 256 { 1 } else { 2 })
        .sum()
}

/// `metadataSize(custom)`: sum of serialised key+value lengths <= max,
/// else `MetadataTooLarge`.
pub fn validate_custom_metadata_size(custom: &CustomMetadata, max: usize) -> EngineResult<()> {
    let total: usize = custom
        .iter()
        .map(|(k, v)| serialised_len(k) + serialised_len(v))
        .sum();
    if total > max {
        return Err(EngineError::MetadataTooLarge);
    }
    Ok(())
}

/// `limit(n)`: `None` means "use the default"; `Some(n)` must be in
/// `1..=max`, else `InvalidMaxKeys`.
pub fn validate_limit(n: Option<u32>, max: u32) -> EngineResult<Option<u32>> {
    match n {
        None => Ok(None),
        Some(0) => Err(EngineError::InvalidMaxKeys),
        Some(n) if n > max => Err(EngineError::InvalidMaxKeys),
        Some(n) => Ok(Some(n)),
    }
}

/// A caller-supplied byte range, either structured or an HTTP header
/// string — both accepted forms from §4.3.
#[derive(Debug, Clone)]
pub enum RangeInput {
    Structured {
        offset: Option<u64>,
        length: Option<u64>,
        suffix: Option<u64>,
    },
    Header(String),
}

/// `range(opts, size)`: normalises to an inclusive `[start,end]`, or
/// `None` to mean "whole object".
///
/// A structured range that is empty, negative, or out of bounds fails
/// `InvalidRange`. An HTTP header that is a multi-range spec, malformed,
/// or otherwise unparseable collapses silently to "whole object" rather
/// than erroring — only `bytes=-0` is explicitly ignored per §8.
pub fn resolve_range(input: Option<RangeInput>, size: u64) -> EngineResult<Option<ByteRange>> {
    let input = match input {
        None => return Ok(None),
        Some(i) => i,
    };

    match input {
        RangeInput::Structured {
            offset,
            length,
            suffix,
        } => resolve_structured_range(offset, length, suffix, size).map(Some),
        RangeInput::Header(header) => Ok(resolve_header_range(&header, size)),
    }
}

fn resolve_structured_range(
    offset: Option<u64>,
    length: Option<u64>,
    suffix: Option<u64>,
    size: u64,
) -> EngineResult<ByteRange> {
    if let Some(suffix) = suffix {
        if suffix == 0 || size == 0 {
            return Err(EngineError::InvalidRange);
        }
        let start = size.saturating_sub(suffix);
        return Ok(ByteRange {
            start,
            end: size - 1,
        });
    }

    let start = offset.unwrap_or(0);
    if start >= size && size > 0 {
        return Err(EngineError::InvalidRange);
    }
    if size == 0 {
        return Err(EngineError::InvalidRange);
    }
    let end = match length {
        Some(len) => {
            if len == 0 {
                return Err(EngineError::InvalidRange);
            }
            (start + len - 1).min(size - 1)
        }
        None => size - 1,
    };
    if end < start {
        return Err(EngineError::InvalidRange);
    }
    Ok(ByteRange { start, end })
}

/// Mirrors the teacher's `parse_range_header`/`resolve_range` pair, but
/// collapses anything it can't confidently satisfy to "whole object"
/// instead of returning `None` from a `StatusCode::RANGE_NOT_SATISFIABLE`
/// handler path — this engine has no transport layer to raise that on.
fn resolve_header_range(header: &str, size: u64) -> Option<ByteRange> {
    let header = header.trim();
    let spec = header.strip_prefix("bytes=")?;

    // Multi-range headers collapse to whole object (no error).
    if spec.contains(',') {
        return None;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        // bytes=-0 is explicitly ignored (treated as no-range).
        if n == 0 || size == 0 {
            return None;
        }
        let start = size.saturating_sub(n);
        return Some(ByteRange {
            start,
            end: size - 1,
        });
    }

    if let Some(start_s) = spec.strip_suffix('-') {
        let start: u64 = start_s.parse().ok()?;
        if size == 0 || start >= size {
            return None;
        }
        return Some(ByteRange {
            start,
            end: size - 1,
        });
    }

    if let Some((start_s, end_s)) = spec.split_once('-') {
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = end_s.parse().ok()?;
        if start > end || size == 0 || start >= size {
            return None;
        }
        return Some(ByteRange {
            start,
            end: end.min(size - 1),
        });
    }

    None
}

/// One element of an `etagMatches`/`etagDoesNotMatch` list.
#[derive(Debug, Clone)]
pub enum EtagMatcher {
    Strong(String),
    Weak(String),
    Wildcard,
}

/// Whether a matcher list match is performed under strong or weak
/// comparison rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Strong,
    Weak,
}

fn includes_etag(list: &[EtagMatcher], etag: &str, comparison: Comparison) -> bool {
    list.iter().any(|m| match m {
        EtagMatcher::Wildcard => true,
        EtagMatcher::Strong(v) => v == etag,
        EtagMatcher::Weak(v) => v == etag && comparison == Comparison::Weak,
    })
}

/// Precondition input, any subset of which may be set — §4.7.
#[derive(Debug, Clone, Default)]
pub struct OnlyIf {
    pub etag_matches: Option<Vec<EtagMatcher>>,
    pub etag_does_not_match: Option<Vec<EtagMatcher>>,
    pub uploaded_before: Option<i64>,
    pub uploaded_after: Option<i64>,
    pub seconds_granularity: bool,
}

fn truncate_to_seconds(ms: i64) -> i64 {
    ms - ms.rem_euclid(1000)
}

/// `condition(row?, onlyIf?)`: evaluates §4.7's precondition algebra.
/// Returns `Ok(())` when the condition passes, or `PreconditionFailed`
/// carrying `row`'s metadata (if any) when it does not.
pub fn evaluate_condition(row: Option<&ObjectMeta>, only_if: Option<&OnlyIf>) -> EngineResult<()> {
    let Some(only_if) = only_if else {
        return Ok(());
    };

    let fail = |row: Option<&ObjectMeta>| EngineError::PreconditionFailed {
        current: row.cloned().map(Box::new),
    };

    let Some(row) = row else {
        let passes = only_if.etag_matches.is_none() && only_if.uploaded_after.is_none();
        return if passes { Ok(()) } else { Err(fail(None)) };
    };

    let last_modified = if only_if.seconds_granularity {
        truncate_to_seconds(row.uploaded_ms)
    } else {
        row.uploaded_ms
    };

    let if_match = match &only_if.etag_matches {
        None => true,
        Some(list) => includes_etag(list, &row.etag, Comparison::Strong),
    };

    let if_none_match = match &only_if.etag_does_not_match {
        None => true,
        Some(list) => !includes_etag(list, &row.etag, Comparison::Weak),
    };

    let uploaded_after_t = only_if.uploaded_after.map(|t| {
        if only_if.seconds_granularity {
            truncate_to_seconds(t)
        } else {
            t
        }
    });
    let if_modified_since = match uploaded_after_t {
        None => true,
        Some(t) => t < last_modified || (only_if.etag_does_not_match.is_some() && if_none_match),
    };

    let uploaded_before_t = only_if.uploaded_before.map(|t| {
        if only_if.seconds_granularity {
            truncate_to_seconds(t)
        } else {
            t
        }
    });
    let if_unmodified_since = match uploaded_before_t {
        None => true,
        Some(t) => last_modified < t || (only_if.etag_matches.is_some() && if_match),
    };

    if if_match && if_none_match && if_modified_since && if_unmodified_since {
        Ok(())
    } else {
        Err(fail(Some(row)))
    }
}

/// `hash(digests, expected)`: every algorithm the caller supplied an
/// expected digest for must match the computed digest byte-for-byte
/// (compared as lowercase hex); returns the canonical hex checksum map
/// built from every algorithm that was computed.
pub fn validate_hash(
    computed: &std::collections::BTreeMap<DigestAlgorithm, Vec<u8>>,
    expected: &std::collections::BTreeMap<DigestAlgorithm, String>,
) -> EngineResult<crate::model::Checksums> {
    for (algo, expected_hex) in expected {
        let Some(computed_bytes) = computed.get(algo) else {
            continue;
        };
        let computed_hex = hex::encode(computed_bytes);
        if !computed_hex.eq_ignore_ascii_case(expected_hex) {
            return Err(EngineError::BadDigest {
                algorithm: *algo,
                provided: expected_hex.clone(),
                computed: computed_hex,
            });
        }
    }

    Ok(computed
        .iter()
        .map(|(algo, bytes)| (*algo, hex::encode(bytes)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_boundary() {
        assert!(validate_key(&"a".repeat(1024), 1024).is_ok());
        assert!(matches!(
            validate_key(&"a".repeat(1025), 1024),
            Err(EngineError::InvalidObjectName)
        ));
        assert!(matches!(
            validate_key("", 1024),
            Err(EngineError::InvalidObjectName)
        ));
    }

    #[test]
    fn size_boundary() {
        assert!(validate_size(100, 100).is_ok());
        assert!(matches!(
            validate_size(101, 100),
            Err(EngineError::EntityTooLarge)
        ));
    }

    #[test]
    fn metadata_size_counts_wide_codepoints_double() {
        let mut custom = CustomMetadata::new();
        custom.insert("k".repeat(2046), "v".to_string());
        assert!(validate_custom_metadata_size(&custom, 2048).is_ok());
        custom.insert("extra".to_string(), "x".to_string());
        assert!(matches!(
            validate_custom_metadata_size(&custom, 2048),
            Err(EngineError::MetadataTooLarge)
        ));

        let mut wide = CustomMetadata::new();
        wide.insert("k".to_string(), "\u{1F600}".to_string()); // one code point >= 256
        assert_eq!(serialised_len("\u{1F600}"), 2);
        let _ = wide;
    }

    #[test]
    fn limit_boundary() {
        assert_eq!(validate_limit(None, 1000).unwrap(), None);
        assert_eq!(validate_limit(Some(1000), 1000).unwrap(), Some(1000));
        assert!(matches!(
            validate_limit(Some(0), 1000),
            Err(EngineError::InvalidMaxKeys)
        ));
        assert!(matches!(
            validate_limit(Some(1001), 1000),
            Err(EngineError::InvalidMaxKeys)
        ));
    }

    #[test]
    fn header_range_suffix_zero_is_ignored() {
        assert_eq!(
            resolve_range(Some(RangeInput::Header("bytes=-0".to_string())), 100).unwrap(),
            None
        );
    }

    #[test]
    fn header_multi_range_collapses_to_whole_object() {
        assert_eq!(
            resolve_range(
                Some(RangeInput::Header("bytes=0-1,2-3".to_string())),
                100
            )
            .unwrap(),
            None
        );
    }

    #[test]
    fn structured_range_past_eof_is_invalid() {
        let result = resolve_range(
            Some(RangeInput::Structured {
                offset: Some(200),
                length: None,
                suffix: None,
            }),
            100,
        );
        assert!(matches!(result, Err(EngineError::InvalidRange)));
    }

    #[test]
    fn structured_range_normalises_inclusive_bounds() {
        let r = resolve_range(
            Some(RangeInput::Structured {
                offset: Some(3),
                length: Some(7),
                suffix: None,
            }),
            100,
        )
        .unwrap()
        .unwrap();
        assert_eq!(r, ByteRange { start: 3, end: 9 });
    }

    fn meta(etag: &str, uploaded_ms: i64) -> ObjectMeta {
        ObjectMeta {
            key: "k".to_string(),
            version: "v".to_string(),
            size: 5,
            etag: etag.to_string(),
            uploaded_ms,
            checksums: Default::default(),
            http_metadata: Default::default(),
            custom_metadata: Default::default(),
        }
    }

    #[test]
    fn condition_none_passes_without_only_if() {
        assert!(evaluate_condition(None, None).is_ok());
        assert!(evaluate_condition(Some(&meta("e", 1)), None).is_ok());
    }

    #[test]
    fn condition_missing_row_requires_unset_match_and_after() {
        let only_if = OnlyIf {
            etag_matches: Some(vec![EtagMatcher::Wildcard]),
            ..Default::default()
        };
        assert!(matches!(
            evaluate_condition(None, Some(&only_if)),
            Err(EngineError::PreconditionFailed { current: None })
        ));
        assert!(evaluate_condition(None, Some(&OnlyIf::default())).is_ok());
    }

    #[test]
    fn condition_etag_does_not_match_fails_on_match() {
        let row = meta("abc", 1000);
        let only_if = OnlyIf {
            etag_does_not_match: Some(vec![EtagMatcher::Strong("abc".to_string())]),
            ..Default::default()
        };
        let err = evaluate_condition(Some(&row), Some(&only_if)).unwrap_err();
        match err {
            EngineError::PreconditionFailed { current } => {
                assert_eq!(current.unwrap().etag, "abc");
            }
            _ => panic!("expected PreconditionFailed"),
        }
    }

    #[test]
    fn validate_hash_rejects_mismatch_and_returns_checksums() {
        let mut computed = std::collections::BTreeMap::new();
        computed.insert(DigestAlgorithm::Md5, vec![0xab, 0xcd]);
        let mut expected = std::collections::BTreeMap::new();
        expected.insert(DigestAlgorithm::Md5, "abcd".to_string());
        let checksums = validate_hash(&computed, &expected).unwrap();
        assert_eq!(checksums.get(&DigestAlgorithm::Md5).unwrap(), "abcd");

        expected.insert(DigestAlgorithm::Md5, "ffff".to_string());
        assert!(matches!(
            validate_hash(&computed, &expected),
            Err(EngineError::BadDigest { .. })
        ));
    }
}
