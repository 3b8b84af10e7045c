use url::Url;

/// Upper bound on a derived segment name, extension included.
pub const MAX_NAME_LEN: usize = 80;

const SEGMENT_EXT: &str = ".ts";
const HASHED_PREFIX: &str = "seg_";
const HASH_TOKEN_LEN: usize = 16;

/// 由分段URL推导出稳定、安全、长度受限的文件名
///
/// The result is always a single path component ending in `.ts`. Names that
/// would exceed [`MAX_NAME_LEN`] collapse to a token derived from the URL's
/// sha256 so that the mapping stays deterministic.
pub fn derive_filename(url: &Url) -> String {
    let raw = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or_default();

    let decoded = match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    };

    let mut name = sanitize(&decoded);
    if name.is_empty() || name == SEGMENT_EXT.trim_start_matches('.') {
        return hashed_name(url);
    }
    if !name.ends_with(SEGMENT_EXT) {
        name.push_str(SEGMENT_EXT);
    }
    if name.len() > MAX_NAME_LEN {
        return hashed_name(url);
    }
    name
}

/// On-disk name of a segment: the derived name prefixed with its zero-padded
/// media sequence number, so lexical order follows playlist order.
///
/// The prefixed name also stays within [`MAX_NAME_LEN`]; a derived name that
/// leaves no room for the prefix is replaced by its hashed form.
pub fn segment_file_name(sequence: u64, url: &Url) -> String {
    let name = format!("{:012}_{}", sequence, derive_filename(url));
    if name.len() > MAX_NAME_LEN {
        return format!("{:012}_{}", sequence, hashed_name(url));
    }
    name
}

fn hashed_name(url: &Url) -> String {
    let digest = sha256::digest(url.as_str());
    format!("{}{}{}", HASHED_PREFIX, &digest[..HASH_TOKEN_LEN], SEGMENT_EXT)
}

fn sanitize(input: &str) -> String {
    let mut name: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // no "..", no hidden files
    while name.contains("..") {
        name = name.replace("..", ".");
    }
    name.trim_start_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn keeps_simple_names() {
        assert_eq!(
            derive_filename(&url("https://cdn.example.com/live/seg_001.ts?token=abc")),
            "seg_001.ts"
        );
    }

    #[test]
    fn appends_extension_when_missing() {
        assert_eq!(
            derive_filename(&url("https://cdn.example.com/live/chunk-17")),
            "chunk-17.ts"
        );
    }

    #[test]
    fn decodes_and_replaces_unsafe_characters() {
        let name = derive_filename(&url("https://cdn.example.com/a/my%20seg%2F..%2Fetc.ts"));
        assert_eq!(name, "my_seg_._etc.ts");
        assert!(!name.contains(".."));
        assert!(!name.contains('/'));
    }

    #[test]
    fn traversal_never_survives() {
        for raw in [
            "https://x.test/%2E%2E%2F%2E%2E%2Fpasswd",
            "https://x.test/..%5C..%5Cwin.ts",
            "https://x.test/...ts",
        ] {
            let name = derive_filename(&url(raw));
            assert!(!name.contains(".."), "{raw} -> {name}");
            assert!(!name.contains('/') && !name.contains('\\'), "{raw} -> {name}");
            assert!(!name.starts_with('.'), "{raw} -> {name}");
            assert!(name.ends_with(".ts"));
        }
    }

    #[test]
    fn long_names_fall_back_to_hash() {
        let long = format!("https://cdn.example.com/{}.ts", "a".repeat(120));
        let name = derive_filename(&url(&long));
        assert!(name.starts_with(HASHED_PREFIX));
        assert!(name.len() <= MAX_NAME_LEN);
        assert_eq!(name, derive_filename(&url(&long)));

        let other = format!("https://cdn.example.com/{}.ts", "b".repeat(120));
        assert_ne!(name, derive_filename(&url(&other)));
    }

    #[test]
    fn empty_path_uses_hash() {
        let name = derive_filename(&url("https://cdn.example.com/"));
        assert!(name.starts_with(HASHED_PREFIX));
        assert!(name.ends_with(".ts"));
    }

    #[test]
    fn sequence_prefix_orders_lexically() {
        let a = segment_file_name(9, &url("https://x.test/z.ts"));
        let b = segment_file_name(10, &url("https://x.test/a.ts"));
        assert_eq!(a, "000000000009_z.ts");
        assert!(a < b);
    }

    #[test]
    fn prefixed_name_stays_within_bound() {
        // 79 characters derived, still kept by derive_filename
        let raw = format!("https://x.test/{}.ts", "c".repeat(76));
        let derived = derive_filename(&url(&raw));
        assert_eq!(derived.len(), 79);

        let name = segment_file_name(42, &url(&raw));
        assert!(name.len() <= MAX_NAME_LEN, "{name}");
        assert!(name.starts_with("000000000042_seg_"));
        assert_eq!(name, segment_file_name(42, &url(&raw)));

        let short = segment_file_name(u64::MAX, &url(&raw));
        assert!(short.len() <= MAX_NAME_LEN, "{short}");
    }
}
