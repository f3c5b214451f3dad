//! Name derivation helpers

/// Turn a free-form model name into a DNS-label friendly slug.
///
/// Underscores and dots become hyphens, letters are lower-cased. The result
/// is stable under repeated application.
pub fn slug(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '_' | '.' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// True when every character is a letter or a digit
///
/// Used to keep user-controlled values out of server command lines.
pub fn is_alphanumeric(value: &str) -> bool {
    value.chars().all(char::is_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_replaces_separators_and_lowercases() {
        assert_eq!(slug("My_Model.V2"), "my-model-v2");
        assert_eq!(slug("my-model-v2"), "my-model-v2");
    }

    #[test]
    fn slug_is_idempotent() {
        for input in ["Llama_3.1-8B", "phi-2", "A.B_C", ""] {
            let once = slug(input);
            assert_eq!(slug(&once), once);
        }
    }

    #[test]
    fn alphanumeric_accepts_plain_tokens() {
        assert!(is_alphanumeric("bfloat16"));
        assert!(is_alphanumeric("awq"));
        assert!(is_alphanumeric(""));
    }

    #[test]
    fn alphanumeric_rejects_shell_and_flag_characters() {
        assert!(!is_alphanumeric("float16 --trust-remote-code"));
        assert!(!is_alphanumeric("awq;rm"));
        assert!(!is_alphanumeric("fp-8"));
    }
}
