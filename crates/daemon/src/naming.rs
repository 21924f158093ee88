use std::path::{Component, Path};
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};

/// Extension given to every converted artifact
pub const OUTPUT_EXTENSION: &str = "mp3";

/// Content type served for converted artifacts
pub const OUTPUT_CONTENT_TYPE: &str = "audio/mpeg";

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Name an upload after its arrival instant plus the original extension.
///
/// A process-wide sequence number follows the millisecond timestamp so two
/// uploads landing in the same clock tick still get distinct names.
pub fn assign_upload_name(original_name: &str, arrived_at: DateTime<Utc>) -> String {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let ext = extension_of(original_name)
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    format!("{}-{:06}{}", arrived_at.timestamp_millis(), seq, ext)
}

/// Replace the extension of an original file name with the output extension.
///
/// Identical original names map to identical output names; a later conversion
/// overwrites the earlier artifact.
pub fn derive_output_name(original_name: &str) -> String {
    let base = base_name(original_name).unwrap_or("audio");
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };
    format!("{}.{}", stem, OUTPUT_EXTENSION)
}

/// Reduce an externally supplied file name to a bare file name.
///
/// Returns `None` when nothing usable is left (empty, `.`, `..`, or a name
/// ending in a separator), so the caller can never address a path outside
/// its own directory.
pub fn sanitize_file_name(supplied: &str) -> Option<String> {
    base_name(supplied).map(str::to_string)
}

fn base_name(name: &str) -> Option<&str> {
    // Treat both separators as path separators regardless of platform
    let last = name.rsplit(['/', '\\']).next()?;
    match Path::new(last).components().next() {
        Some(Component::Normal(_)) if !last.contains('\0') => Some(last),
        _ => None,
    }
}

fn extension_of(name: &str) -> Option<String> {
    let base = base_name(name)?;
    let idx = base.rfind('.')?;
    if idx == 0 || idx + 1 == base.len() {
        return None;
    }
    Some(base[idx + 1..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn upload_name_keeps_original_extension() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let name = assign_upload_name("holiday clip.mp4", at);
        assert!(name.starts_with(&at.timestamp_millis().to_string()));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn upload_name_without_extension() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let name = assign_upload_name("README", at);
        assert!(!name.contains('.'));
    }

    #[test]
    fn same_tick_uploads_do_not_collide() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let names: HashSet<_> = (0..500).map(|_| assign_upload_name("clip.mp4", at)).collect();
        assert_eq!(names.len(), 500);
    }

    #[test]
    fn output_name_replaces_extension() {
        assert_eq!(derive_output_name("clip.mp4"), "clip.mp3");
        assert_eq!(derive_output_name("my.holiday.clip.mov"), "my.holiday.clip.mp3");
        assert_eq!(derive_output_name("noext"), "noext.mp3");
        assert_eq!(derive_output_name(".hidden"), ".hidden.mp3");
        assert_eq!(derive_output_name("C:\\videos\\clip.mp4"), "clip.mp3");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("..\\..\\boot.ini").as_deref(), Some("boot.ini"));
        assert_eq!(sanitize_file_name("/abs/clip.mp3").as_deref(), Some("clip.mp3"));
        assert_eq!(sanitize_file_name("clip.mp3").as_deref(), Some("clip.mp3"));
    }

    #[test]
    fn sanitize_rejects_unusable_names() {
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("."), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name("a\0b"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_sanitized_name_never_escapes(segments in prop::collection::vec(
            prop_oneof![
                Just("..".to_string()),
                Just(".".to_string()),
                "[a-zA-Z0-9_.-]{1,12}",
            ],
            1..6,
        ), backslash in prop::bool::ANY) {
            let sep = if backslash { "\\" } else { "/" };
            let supplied = segments.join(sep);

            if let Some(clean) = sanitize_file_name(&supplied) {
                prop_assert!(!clean.contains('/') && !clean.contains('\\'));
                prop_assert!(clean != "." && clean != "..");

                let root = Path::new("/srv/converted");
                let joined = root.join(&clean);
                prop_assert_eq!(joined.parent(), Some(root));
            }
        }

        #[test]
        fn test_output_name_always_has_output_extension(name in "[a-zA-Z0-9 _.-]{1,30}") {
            let out = derive_output_name(&name);
            prop_assert!(out.ends_with(".mp3"));
            prop_assert!(!out.contains('/'));
        }
    }
}
