/// String helpers shared by configuration loading, task logs and activity text.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// True values: `"1"`, `"true"`, `"yes"` (case-insensitive).
    /// False values: `"0"`, `"false"`, `"no"` (case-insensitive).
    /// Returns `None` for anything else.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        }
    }

    /// Replace characters that are invalid in file names with `_`.
    pub fn format_into_safe_filename(name: &str) -> String {
        let invalid_chars: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
        name.chars()
            .map(|ch| {
                if invalid_chars.contains(&ch) || (ch as u32) < 0x20 {
                    '_'
                } else {
                    ch
                }
            })
            .collect()
    }

    /// Return a prefix of at most `count` characters (not bytes).
    pub fn substring_prefix(value: &str, count: usize) -> &str {
        match value.char_indices().nth(count) {
            Some((idx, _)) => &value[..idx],
            None => value,
        }
    }

    /// Split a comma separated list, trimming entries and dropping empty ones.
    pub fn split_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_to_bool_values() {
        assert_eq!(StringUtil::convert_to_bool("1"), Some(true));
        assert_eq!(StringUtil::convert_to_bool("True"), Some(true));
        assert_eq!(StringUtil::convert_to_bool(" yes "), Some(true));
        assert_eq!(StringUtil::convert_to_bool("0"), Some(false));
        assert_eq!(StringUtil::convert_to_bool("FALSE"), Some(false));
        assert_eq!(StringUtil::convert_to_bool("maybe"), None);
        assert_eq!(StringUtil::convert_to_bool(""), None);
    }

    #[test]
    fn safe_filename() {
        assert_eq!(
            StringUtil::format_into_safe_filename("a/b:c*d"),
            "a_b_c_d"
        );
        assert_eq!(StringUtil::format_into_safe_filename("plain"), "plain");
    }

    #[test]
    fn prefix_counts_chars() {
        assert_eq!(StringUtil::substring_prefix("héllo", 2), "hé");
        assert_eq!(StringUtil::substring_prefix("abc", 10), "abc");
        assert_eq!(StringUtil::substring_prefix("abc", 0), "");
    }

    #[test]
    fn split_list_trims() {
        assert_eq!(
            StringUtil::split_list(" sleep, blender-render ,,"),
            vec!["sleep".to_string(), "blender-render".to_string()]
        );
        assert!(StringUtil::split_list("").is_empty());
    }
}
