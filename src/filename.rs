/// Derive a filesystem-safe file name from a page URL.
///
/// The scheme is stripped first so `http` and `https` variants of the
/// same page map to the same name. The name is built from the final
/// path segment, keeping only alphanumeric characters plus `.`, `-`
/// and `_`, with a `.html` extension appended when missing.
pub fn derive_filename(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    let segment = without_scheme
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");

    let name: String = segment
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();

    if name.ends_with(".html") {
        name
    } else {
        format!("{name}.html")
    }
}
