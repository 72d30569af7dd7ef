//! Worker authentication checks.

/// Compares tokens without short-circuiting on the first differing byte.
pub(super) fn tokens_match(expected: &str, presented: &str) -> bool {
    let (expected, presented) = (expected.as_bytes(), presented.as_bytes());
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0_u8, |difference, (left, right)| difference | (left ^ right))
        == 0
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::tokens_match;

    #[rstest]
    #[case("secret", "secret", true)]
    #[case("secret", "secreT", false)]
    #[case("secret", "secret-longer", false)]
    #[case("secret", "", false)]
    fn compares_tokens(#[case] expected: &str, #[case] presented: &str, #[case] matches: bool) {
        assert_eq!(tokens_match(expected, presented), matches);
    }
}
